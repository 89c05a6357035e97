use super::MemoryStore;
use crate::models::{CreateSubscriber, Subscriber, UpdateSubscriber};
use crate::pagination::{
    paginate_in_memory, PageToken, Pageable, Pagination, PaginationCursor, Scope, SegmentScan,
};
use crate::repository::subscribers::keyset_cursor;
use crate::repository::SubscriberRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailflock_common::types::{SegmentId, SubscriberId, UserId};
use mailflock_common::{Error, Result};
use sqlx::types::Json;

impl MemoryStore {
    /// Create a subscriber with a fixed creation time
    pub async fn insert_subscriber_at(
        &self,
        input: CreateSubscriber,
        created_at: DateTime<Utc>,
    ) -> Result<Subscriber> {
        let mut state = self.state.write().await;

        if state
            .subscribers
            .values()
            .any(|s| s.user_id == input.user_id && s.email == input.email)
        {
            return Err(Error::Conflict(format!(
                "Subscriber with email {} already exists",
                input.email
            )));
        }
        let segment_ids = state.owned_segments(input.user_id, &input.segment_ids)?;

        let id = state.next_id();
        let subscriber = Subscriber {
            id,
            user_id: input.user_id,
            name: input.name,
            email: input.email,
            metadata: Json(input.metadata),
            active: true,
            blacklisted: false,
            created_at,
            updated_at: created_at,
            segments: Vec::new(),
        };
        state.subscribers.insert(id, subscriber.clone());
        for segment_id in segment_ids {
            state.memberships.insert((id, segment_id));
        }

        Ok(state.with_segments(&subscriber))
    }

    /// Flag a subscriber as blacklisted
    pub async fn blacklist(&self, user_id: UserId, id: SubscriberId) -> Result<()> {
        let mut state = self.state.write().await;
        match state.subscribers.get_mut(&id) {
            Some(s) if s.user_id == user_id => {
                s.blacklisted = true;
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Subscriber {} not found", id))),
        }
    }

    async fn list_scoped(
        &self,
        user_id: UserId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Subscriber>> {
        let state = self.state.read().await;
        let rows: Vec<Subscriber> = state
            .subscribers
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| state.with_segments(s))
            .collect();

        let mut page = paginate_in_memory(cursor, user_id, &rows)?;
        for subscriber in &mut page.collection {
            subscriber.segments.clear();
        }
        Ok(page)
    }

    /// Deactivate matching subscribers; true when any was active
    async fn set_inactive(&self, user_id: UserId, matches: impl Fn(&Subscriber) -> bool) -> bool {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut changed = false;
        for subscriber in state.subscribers.values_mut() {
            if subscriber.user_id == user_id && subscriber.active && matches(subscriber) {
                subscriber.active = false;
                subscriber.updated_at = now;
                changed = true;
            }
        }
        changed
    }

    /// Remove matching subscribers with their memberships; returns how many
    async fn remove_where(&self, user_id: UserId, matches: impl Fn(&Subscriber) -> bool) -> usize {
        let mut state = self.state.write().await;
        let doomed: Vec<SubscriberId> = state
            .subscribers
            .values()
            .filter(|s| s.user_id == user_id && matches(s))
            .map(|s| s.id)
            .collect();

        for id in &doomed {
            state.memberships.retain(|(sub, _)| sub != id);
            state.subscribers.remove(id);
        }
        doomed.len()
    }
}

#[async_trait]
impl SubscriberRepository for MemoryStore {
    async fn create(&self, input: CreateSubscriber) -> Result<Subscriber> {
        self.insert_subscriber_at(input, Utc::now()).await
    }

    async fn get(&self, user_id: UserId, id: SubscriberId) -> Result<Option<Subscriber>> {
        let state = self.state.read().await;
        Ok(state
            .subscribers
            .get(&id)
            .filter(|s| s.user_id == user_id)
            .map(|s| state.with_segments(s)))
    }

    async fn get_by_email(&self, user_id: UserId, email: &str) -> Result<Option<Subscriber>> {
        let state = self.state.read().await;
        Ok(state
            .subscribers
            .values()
            .find(|s| s.user_id == user_id && s.email == email)
            .map(|s| state.with_segments(s)))
    }

    async fn get_by_ids(&self, user_id: UserId, ids: &[SubscriberId]) -> Result<Vec<Subscriber>> {
        let state = self.state.read().await;
        let mut found: Vec<Subscriber> = ids
            .iter()
            .filter_map(|id| state.subscribers.get(id))
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.page_key().cmp(&a.page_key()));
        found.dedup_by_key(|s| s.id);
        Ok(found)
    }

    async fn list(
        &self,
        user_id: UserId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Subscriber>> {
        self.list_scoped(user_id, cursor).await
    }

    async fn list_after(
        &self,
        user_id: UserId,
        after: Option<PageToken>,
        limit: i64,
    ) -> Result<Vec<Subscriber>> {
        let page = self.list_scoped(user_id, &keyset_cursor(after, limit)).await?;
        Ok(page.collection)
    }

    async fn list_by_segment(
        &self,
        user_id: UserId,
        segment_id: SegmentId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Subscriber>> {
        let cursor = cursor.clone().with_scope(Scope::InSegment(segment_id));
        self.list_scoped(user_id, &cursor).await
    }

    async fn update(
        &self,
        user_id: UserId,
        id: SubscriberId,
        input: UpdateSubscriber,
    ) -> Result<Subscriber> {
        let mut state = self.state.write().await;

        // Same order as the database path: scalar update, membership wipe,
        // then the segment attach that may fail and roll everything back.
        let Some(original) = state
            .subscribers
            .get(&id)
            .filter(|s| s.user_id == user_id)
            .cloned()
        else {
            return Err(Error::NotFound(format!("Subscriber {} not found", id)));
        };
        let original_segments = state.segment_ids_of(id);

        let mut staged = original.clone();
        staged.name = input.name;
        staged.metadata = Json(input.metadata);
        staged.active = input.active;
        staged.updated_at = Utc::now();
        state.subscribers.insert(id, staged.clone());
        state.memberships.retain(|(sub, _)| *sub != id);

        match state.owned_segments(user_id, &input.segment_ids) {
            Ok(segment_ids) => {
                for segment_id in segment_ids {
                    state.memberships.insert((id, segment_id));
                }
                Ok(state.with_segments(&staged))
            }
            Err(e) => {
                state.subscribers.insert(id, original);
                for segment_id in original_segments {
                    state.memberships.insert((id, segment_id));
                }
                Err(e)
            }
        }
    }

    async fn deactivate(&self, user_id: UserId, id: SubscriberId) -> Result<bool> {
        Ok(self.set_inactive(user_id, |s| s.id == id).await)
    }

    async fn deactivate_by_email(&self, user_id: UserId, email: &str) -> Result<bool> {
        Ok(self.set_inactive(user_id, |s| s.email == email).await)
    }

    async fn delete(&self, user_id: UserId, id: SubscriberId) -> Result<()> {
        if self.remove_where(user_id, |s| s.id == id).await == 0 {
            return Err(Error::NotFound(format!("Subscriber {} not found", id)));
        }
        Ok(())
    }

    async fn delete_by_email(&self, user_id: UserId, email: &str) -> Result<()> {
        if self.remove_where(user_id, |s| s.email == email).await == 0 {
            return Err(Error::NotFound(format!(
                "Subscriber with email {} not found",
                email
            )));
        }
        Ok(())
    }

    async fn total(&self, user_id: UserId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .subscribers
            .values()
            .filter(|s| s.user_id == user_id)
            .count() as i64)
    }

    async fn distinct_by_segments(&self, scan: &SegmentScan) -> Result<Vec<Subscriber>> {
        let state = self.state.read().await;
        let mut batch: Vec<Subscriber> = state
            .subscribers
            .values()
            .filter(|s| scan.matches(s, &state.segment_ids_of(s.id)))
            .cloned()
            .collect();

        batch.sort_by_key(|s| s.page_key());
        batch.truncate(scan.limit.max(0) as usize);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateSegment;
    use crate::pagination::Resource;
    use crate::repository::SegmentRepository;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, HashSet};

    fn new_subscriber(user_id: UserId, email: &str, segment_ids: Vec<SegmentId>) -> CreateSubscriber {
        CreateSubscriber {
            user_id,
            name: email.split('@').next().unwrap_or_default().to_string(),
            email: email.to_string(),
            metadata: BTreeMap::new(),
            segment_ids,
        }
    }

    async fn segment(store: &MemoryStore, user_id: UserId, name: &str) -> SegmentId {
        SegmentRepository::create(
            store,
            CreateSegment {
                user_id,
                name: name.to_string(),
            },
        )
        .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts_per_user() {
        let store = MemoryStore::new();

        SubscriberRepository::create(&store, new_subscriber(7, "john@example.com", vec![]))
            .await
            .unwrap();

        let err = SubscriberRepository::create(&store, new_subscriber(7, "john@example.com", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let other = SubscriberRepository::create(&store, new_subscriber(8, "john@example.com", vec![]))
            .await
            .unwrap();
        assert_eq!(other.user_id, 8);
    }

    // The scalar fields are already overwritten when the foreign segment is
    // rejected, so this exercises the rollback rather than an up-front check.
    #[tokio::test]
    async fn test_failed_segment_replacement_leaves_subscriber_unchanged() {
        let store = MemoryStore::new();
        let news = segment(&store, 7, "news").await;
        let foreign = segment(&store, 8, "theirs").await;

        let created = SubscriberRepository::create(&store, new_subscriber(7, "jane@example.com", vec![news]))
            .await
            .unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("plan".to_string(), "pro".to_string());
        let err = store
            .update(
                7,
                created.id,
                UpdateSubscriber {
                    name: "Renamed".to_string(),
                    metadata,
                    active: false,
                    segment_ids: vec![news, foreign],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let after = SubscriberRepository::get(&store, 7, created.id).await.unwrap().unwrap();
        assert_eq!(after.name, "jane");
        assert_eq!(after.updated_at, created.updated_at);
        assert!(after.active);
        assert!(after.metadata.is_empty());
        assert_eq!(after.segments.iter().map(|s| s.id).collect::<Vec<_>>(), vec![news]);
    }

    #[tokio::test]
    async fn test_update_replaces_segments() {
        let store = MemoryStore::new();
        let a = segment(&store, 7, "a").await;
        let b = segment(&store, 7, "b").await;

        let created = SubscriberRepository::create(&store, new_subscriber(7, "amy@example.com", vec![a]))
            .await
            .unwrap();
        let updated = store
            .update(
                7,
                created.id,
                UpdateSubscriber {
                    name: "Amy".to_string(),
                    metadata: BTreeMap::new(),
                    active: true,
                    segment_ids: vec![b],
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "Amy");
        assert_eq!(updated.segments.iter().map(|s| s.id).collect::<Vec<_>>(), vec![b]);
        assert_eq!(store.total_subscribers(7, a).await.unwrap(), 0);
        assert_eq!(store.total_subscribers(7, b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_clears_membership() {
        let store = MemoryStore::new();
        let a = segment(&store, 7, "a").await;
        let created = SubscriberRepository::create(&store, new_subscriber(7, "bob@example.com", vec![a]))
            .await
            .unwrap();

        SubscriberRepository::delete(&store, 7, created.id).await.unwrap();

        assert!(SubscriberRepository::get(&store, 7, created.id).await.unwrap().is_none());
        assert_eq!(store.total_subscribers(7, a).await.unwrap(), 0);
        assert!(matches!(
            SubscriberRepository::delete(&store, 7, created.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_of_another_users_subscriber_is_not_found() {
        let store = MemoryStore::new();
        let a = segment(&store, 7, "a").await;
        let created = SubscriberRepository::create(&store, new_subscriber(7, "kim@example.com", vec![a]))
            .await
            .unwrap();

        assert!(matches!(
            SubscriberRepository::delete(&store, 8, created.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.delete_by_email(8, "kim@example.com").await,
            Err(Error::NotFound(_))
        ));

        let kept = SubscriberRepository::get(&store, 7, created.id).await.unwrap().unwrap();
        assert_eq!(kept.segments.len(), 1);
        store.delete_by_email(7, "kim@example.com").await.unwrap();
        assert_eq!(SubscriberRepository::total(&store, 7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let store = MemoryStore::new();
        let created = SubscriberRepository::create(&store, new_subscriber(7, "eve@example.com", vec![]))
            .await
            .unwrap();

        assert!(store.deactivate_by_email(7, "eve@example.com").await.unwrap());
        assert!(!store.deactivate(7, created.id).await.unwrap());
        assert!(!store.deactivate(8, created.id).await.unwrap());

        let after = SubscriberRepository::get(&store, 7, created.id).await.unwrap().unwrap();
        assert!(!after.active);
    }

    #[tokio::test]
    async fn test_segment_scan_visits_each_member_once() {
        let store = MemoryStore::new();
        let a = segment(&store, 7, "a").await;
        let b = segment(&store, 7, "b").await;
        let base = Utc::now() - Duration::hours(1);

        let mut expected = HashSet::new();
        for i in 0..45 {
            let segments = match i % 3 {
                0 => vec![a],
                1 => vec![b],
                _ => vec![a, b],
            };
            // Groups of five share a timestamp.
            let created = store
                .insert_subscriber_at(
                    new_subscriber(7, &format!("s{}@example.com", i), segments),
                    base + Duration::seconds(i / 5),
                )
                .await
                .unwrap();
            expected.insert(created.id);
        }
        let blocked = store
            .insert_subscriber_at(new_subscriber(7, "spam@example.com", vec![a]), base)
            .await
            .unwrap();
        store.blacklist(7, blocked.id).await.unwrap();

        let snapshot = Utc::now();
        store
            .insert_subscriber_at(new_subscriber(7, "late@example.com", vec![a]), snapshot)
            .await
            .unwrap();

        let mut scan = SegmentScan::eligible(7, vec![a, b], snapshot).with_limit(7);
        let mut seen = Vec::new();
        loop {
            let batch = store.distinct_by_segments(&scan).await.unwrap();
            let Some(last) = batch.last() else { break };
            scan.advance_past(last);
            seen.extend(batch.iter().map(|s| s.id));
        }

        assert_eq!(seen.len(), expected.len());
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_list_after_walks_every_subscriber_once() {
        let store = MemoryStore::new();
        let base = Utc::now() - Duration::hours(1);
        for i in 0..23 {
            store
                .insert_subscriber_at(
                    new_subscriber(7, &format!("w{}@example.com", i), vec![]),
                    base + Duration::seconds(i / 4),
                )
                .await
                .unwrap();
        }
        SubscriberRepository::create(&store, new_subscriber(8, "other@example.com", vec![]))
            .await
            .unwrap();

        let mut after = None;
        let mut seen = Vec::new();
        loop {
            let batch = store.list_after(7, after, 10).await.unwrap();
            assert!(batch.len() <= 10);
            let Some(last) = batch.last() else { break };
            after = Some(PageToken::of(last));
            seen.extend(batch.iter().map(|s| s.id));
        }

        assert_eq!(seen.len(), 23);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 23);
    }

    #[tokio::test]
    async fn test_list_by_segment_and_email_scope() {
        let store = MemoryStore::new();
        let a = segment(&store, 7, "a").await;
        for email in ["ann@example.com", "andy@example.com", "zoe@example.com"] {
            SubscriberRepository::create(&store, new_subscriber(7, email, vec![a]))
                .await
                .unwrap();
        }
        SubscriberRepository::create(&store, new_subscriber(7, "solo@example.com", vec![]))
            .await
            .unwrap();

        let cursor = PaginationCursor::new(Resource::Subscribers, None);
        let members = store.list_by_segment(7, a, &cursor).await.unwrap();
        assert_eq!(members.total, 3);
        assert!(members.collection.iter().all(|s| s.segments.is_empty()));

        let mut filters = BTreeMap::new();
        filters.insert("email".to_string(), "an".to_string());
        let cursor = PaginationCursor::new(Resource::Subscribers, None).with_filters(&filters);
        let page = SubscriberRepository::list(&store, 7, &cursor).await.unwrap();
        assert_eq!(page.total, 2);
    }
}
