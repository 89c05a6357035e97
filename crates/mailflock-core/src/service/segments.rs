//! Segment service - validated segment writes

use crate::validation::{ensure_valid, validate_segment, validate_segment_name};
use mailflock_common::types::{SegmentId, UserId};
use mailflock_common::Result;
use mailflock_storage::{CreateSegment, Segment, SegmentRepository};
use std::sync::Arc;
use tracing::info;

pub struct SegmentService {
    segments: Arc<dyn SegmentRepository>,
}

impl SegmentService {
    pub fn new(segments: Arc<dyn SegmentRepository>) -> Self {
        Self { segments }
    }

    pub async fn create(&self, input: CreateSegment) -> Result<Segment> {
        ensure_valid(validate_segment(&input))?;
        self.segments.create(input).await
    }

    pub async fn rename(&self, user_id: UserId, id: SegmentId, name: &str) -> Result<Segment> {
        ensure_valid(validate_segment_name(name))?;
        self.segments.rename(user_id, id, name).await
    }

    /// Remove a segment; its subscribers are kept
    pub async fn delete(&self, user_id: UserId, id: SegmentId) -> Result<()> {
        self.segments.delete(user_id, id).await?;
        info!(user_id, segment_id = id, "Segment deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflock_common::Error;
    use mailflock_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_segment_names_are_validated() {
        let store = MemoryStore::new();
        let service = SegmentService::new(Arc::new(store.clone()));

        let err = service
            .create(CreateSegment {
                user_id: 7,
                name: " ".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
        assert_eq!(SegmentRepository::total(&store, 7).await.unwrap(), 0);

        let vip = service
            .create(CreateSegment {
                user_id: 7,
                name: "vip".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            service.rename(7, vip.id, "").await,
            Err(Error::ValidationFailed(_))
        ));
        assert_eq!(service.rename(7, vip.id, "gold").await.unwrap().name, "gold");

        service.delete(7, vip.id).await.unwrap();
        assert!(matches!(service.delete(7, vip.id).await, Err(Error::NotFound(_))));
    }
}
