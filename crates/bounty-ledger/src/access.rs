//! Stateless caller predicates.
//!
//! Every mutating operation consults the relevant predicate before
//! touching any state; a failed predicate short-circuits with zero side
//! effects.

use crate::types::ProjectRecord;
use bounty_escrow::AccountId;

/// True when the caller is the record's creating owner.
pub fn is_owner(record: &ProjectRecord, caller: &AccountId) -> bool {
    &record.project_owner == caller
}

/// True when the caller is the record's assigned worker.
pub fn is_worker(record: &ProjectRecord, caller: &AccountId) -> bool {
    record.worker.as_ref() == Some(caller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProjectStatus;
    use bounty_escrow::TokenAmount;
    use chrono::Utc;

    fn record(owner: &str, worker: Option<&str>) -> ProjectRecord {
        ProjectRecord {
            id: "p1".to_string(),
            github_issue_link: String::new(),
            description: String::new(),
            reward: TokenAmount::from_base_units(1),
            status: ProjectStatus::Created,
            project_owner: AccountId::new(owner),
            worker: worker.map(AccountId::new),
            created_at: Utc::now(),
            seq: 0,
        }
    }

    #[test]
    fn owner_predicate() {
        let rec = record("company1", None);
        assert!(is_owner(&rec, &AccountId::new("company1")));
        assert!(!is_owner(&rec, &AccountId::new("company2")));
    }

    #[test]
    fn worker_predicate() {
        let unclaimed = record("company1", None);
        assert!(!is_worker(&unclaimed, &AccountId::new("alice")));

        let claimed = record("company1", Some("alice"));
        assert!(is_worker(&claimed, &AccountId::new("alice")));
        assert!(!is_worker(&claimed, &AccountId::new("company1")));
    }
}
