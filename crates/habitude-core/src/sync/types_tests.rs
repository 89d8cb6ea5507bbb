//! Tests for sync types.

#[cfg(test)]
mod tests {
    use super::super::types::*;

    #[test]
    fn test_priority_order() {
        let complete = priority(EntityType::Task, ActionType::Complete);
        let tick = priority(EntityType::Habit, ActionType::Tick);
        let create = priority(EntityType::Task, ActionType::Create);
        let update = priority(EntityType::Habit, ActionType::Update);
        let delete = priority(EntityType::Task, ActionType::Delete);

        assert!(complete < tick);
        assert!(tick < create);
        assert!(create < update);
        assert!(update < delete);
    }

    #[test]
    fn test_priority_is_total() {
        let entities = [EntityType::Task, EntityType::Habit, EntityType::User];
        let actions = [
            ActionType::Create,
            ActionType::Update,
            ActionType::Delete,
            ActionType::Complete,
            ActionType::Tick,
        ];
        let mut seen = std::collections::HashSet::new();
        for e in entities {
            for a in actions {
                assert!(seen.insert(priority(e, a)), "duplicate priority for {e} {a}");
            }
        }
    }

    #[test]
    fn test_enum_round_trip_through_str() {
        assert_eq!("IN_FLIGHT".parse::<ActionStatus>().unwrap(), ActionStatus::InFlight);
        assert_eq!("conflict".parse::<FailureKind>().unwrap(), FailureKind::Conflict);
        assert_eq!("SYNCING".parse::<EntitySyncStatus>().unwrap(), EntitySyncStatus::Syncing);
        assert!("ARCHIVED".parse::<ActionStatus>().is_err());
    }

    #[test]
    fn test_remote_error_classification() {
        assert_eq!(RemoteError::from_status(401, "x").kind(), FailureKind::Auth);
        assert_eq!(RemoteError::from_status(403, "x").kind(), FailureKind::Auth);
        assert_eq!(RemoteError::from_status(409, "x").kind(), FailureKind::Conflict);
        assert_eq!(RemoteError::from_status(412, "x").kind(), FailureKind::Conflict);
        assert_eq!(RemoteError::from_status(429, "x").kind(), FailureKind::Transient);
        assert_eq!(RemoteError::from_status(503, "x").kind(), FailureKind::Transient);
        assert_eq!(RemoteError::from_status(422, "x").kind(), FailureKind::Permanent);
        assert_eq!(RemoteError::from_status(404, "x").kind(), FailureKind::Permanent);
    }

    #[test]
    fn test_failure_blocking() {
        assert!(FailureKind::Conflict.blocks_successors());
        assert!(FailureKind::Auth.blocks_successors());
        assert!(!FailureKind::Permanent.blocks_successors());
        assert!(!FailureKind::Exhausted.blocks_successors());
    }

    #[test]
    fn test_aggregate_state_serializes_tagged() {
        let state = AggregateSyncState::Failed {
            count: 1,
            errors: vec!["boom".into()],
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["count"], 1);
    }
}
