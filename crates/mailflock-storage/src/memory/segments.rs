use super::MemoryStore;
use crate::models::{CreateSegment, Segment};
use crate::pagination::{paginate_in_memory, Pageable, Pagination, PaginationCursor};
use crate::repository::SegmentRepository;
use async_trait::async_trait;
use chrono::Utc;
use mailflock_common::types::{SegmentId, SubscriberId, UserId};
use mailflock_common::{Error, Result};

fn not_found(id: SegmentId) -> Error {
    Error::NotFound(format!("Segment {} not found", id))
}

#[async_trait]
impl SegmentRepository for MemoryStore {
    async fn create(&self, input: CreateSegment) -> Result<Segment> {
        let mut state = self.state.write().await;

        if state
            .segments
            .values()
            .any(|s| s.user_id == input.user_id && s.name == input.name)
        {
            return Err(Error::Conflict(format!(
                "Segment {} already exists",
                input.name
            )));
        }

        let now = Utc::now();
        let segment = Segment {
            id: state.next_id(),
            user_id: input.user_id,
            name: input.name,
            subscribers_in_segment: 0,
            created_at: now,
            updated_at: now,
        };
        state.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    async fn get(&self, user_id: UserId, id: SegmentId) -> Result<Option<Segment>> {
        let state = self.state.read().await;
        Ok(state
            .segments
            .get(&id)
            .filter(|s| s.user_id == user_id)
            .map(|s| state.segment_with_count(s)))
    }

    async fn get_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Segment>> {
        let state = self.state.read().await;
        Ok(state
            .segments
            .values()
            .find(|s| s.user_id == user_id && s.name == name)
            .map(|s| state.segment_with_count(s)))
    }

    async fn get_by_ids(&self, user_id: UserId, ids: &[SegmentId]) -> Result<Vec<Segment>> {
        let state = self.state.read().await;
        let mut found: Vec<Segment> = state
            .segments
            .values()
            .filter(|s| s.user_id == user_id && ids.contains(&s.id))
            .map(|s| state.segment_with_count(s))
            .collect();
        found.sort_by(|a, b| b.page_key().cmp(&a.page_key()));
        Ok(found)
    }

    async fn list(&self, user_id: UserId, cursor: &PaginationCursor) -> Result<Pagination<Segment>> {
        let state = self.state.read().await;
        let rows: Vec<Segment> = state
            .segments
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| state.segment_with_count(s))
            .collect();
        paginate_in_memory(cursor, user_id, &rows)
    }

    async fn rename(&self, user_id: UserId, id: SegmentId, name: &str) -> Result<Segment> {
        let mut state = self.state.write().await;

        if state
            .segments
            .values()
            .any(|s| s.user_id == user_id && s.name == name && s.id != id)
        {
            return Err(Error::Conflict(format!("Segment {} already exists", name)));
        }

        let renamed = match state.segments.get_mut(&id) {
            Some(segment) if segment.user_id == user_id => {
                segment.name = name.to_string();
                segment.updated_at = Utc::now();
                segment.clone()
            }
            _ => return Err(not_found(id)),
        };
        Ok(state.segment_with_count(&renamed))
    }

    async fn delete(&self, user_id: UserId, id: SegmentId) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.segments.get(&id).is_some_and(|s| s.user_id == user_id) {
            return Err(Error::NotFound(format!("Segment {} not found", id)));
        }
        state.memberships.retain(|(_, seg)| *seg != id);
        state.segments.remove(&id);
        Ok(())
    }

    async fn total(&self, user_id: UserId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.segments.values().filter(|s| s.user_id == user_id).count() as i64)
    }

    async fn total_subscribers(&self, user_id: UserId, id: SegmentId) -> Result<i64> {
        let state = self.state.read().await;
        match state.segments.get(&id) {
            Some(s) if s.user_id == user_id => Ok(state.segment_count(id)),
            _ => Ok(0),
        }
    }

    async fn append_subscribers(
        &self,
        user_id: UserId,
        id: SegmentId,
        subscriber_ids: &[SubscriberId],
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        if !state.segments.get(&id).is_some_and(|s| s.user_id == user_id) {
            return Err(not_found(id));
        }

        let owned: Vec<SubscriberId> = subscriber_ids
            .iter()
            .copied()
            .filter(|sub| {
                state
                    .subscribers
                    .get(sub)
                    .is_some_and(|s| s.user_id == user_id)
            })
            .collect();

        let mut added = 0;
        for sub in owned {
            if state.memberships.insert((sub, id)) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn detach_subscribers(
        &self,
        user_id: UserId,
        id: SegmentId,
        subscriber_ids: &[SubscriberId],
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        if !state.segments.get(&id).is_some_and(|s| s.user_id == user_id) {
            return Err(not_found(id));
        }

        let mut removed = 0;
        for sub in subscriber_ids {
            if state.memberships.remove(&(*sub, id)) {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateSubscriber;
    use crate::pagination::Resource;
    use crate::repository::SubscriberRepository;
    use std::collections::BTreeMap;

    async fn new_segment(store: &MemoryStore, user_id: UserId, name: &str) -> Result<Segment> {
        SegmentRepository::create(
            store,
            CreateSegment {
                user_id,
                name: name.to_string(),
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_segment_names_are_unique_per_user() {
        let store = MemoryStore::new();
        new_segment(&store, 7, "vip").await.unwrap();

        assert!(matches!(
            new_segment(&store, 7, "vip").await,
            Err(Error::Conflict(_))
        ));
        assert!(new_segment(&store, 8, "vip").await.is_ok());
    }

    #[tokio::test]
    async fn test_append_detach_and_counts() {
        let store = MemoryStore::new();
        let vip = new_segment(&store, 7, "vip").await.unwrap();

        let mut ids = Vec::new();
        for email in ["a@example.com", "b@example.com"] {
            let s = SubscriberRepository::create(
                &store,
                CreateSubscriber {
                    user_id: 7,
                    name: String::new(),
                    email: email.to_string(),
                    metadata: BTreeMap::new(),
                    segment_ids: vec![],
                },
            )
            .await
            .unwrap();
            ids.push(s.id);
        }

        assert_eq!(store.append_subscribers(7, vip.id, &ids).await.unwrap(), 2);
        assert_eq!(store.append_subscribers(7, vip.id, &ids).await.unwrap(), 0);

        let fetched = SegmentRepository::get(&store, 7, vip.id).await.unwrap().unwrap();
        assert_eq!(fetched.subscribers_in_segment, 2);

        assert_eq!(store.detach_subscribers(7, vip.id, &ids[..1]).await.unwrap(), 1);
        assert_eq!(store.total_subscribers(7, vip.id).await.unwrap(), 1);

        assert!(matches!(
            store.append_subscribers(8, vip.id, &ids).await,
            Err(Error::NotFound(_))
        ));

        assert!(matches!(
            SegmentRepository::delete(&store, 8, vip.id).await,
            Err(Error::NotFound(_))
        ));
        SegmentRepository::delete(&store, 7, vip.id).await.unwrap();
        assert!(matches!(
            SegmentRepository::delete(&store, 7, vip.id).await,
            Err(Error::NotFound(_))
        ));
        let page = SegmentRepository::list(&store, 7, &PaginationCursor::new(Resource::Segments, None))
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(SubscriberRepository::get(&store, 7, ids[0]).await.unwrap().is_some());
    }
}
