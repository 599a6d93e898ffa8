//! Canonical stack names for a tenant/resource pair.
//!
//! Names have the shape `tenant-<account>.<resource>`. Account ids are GCP
//! project ids (lowercase letters, digits, hyphens), resource ids are dataset
//! ids (letters, digits, underscores, hyphens). Neither alphabet contains `.`,
//! so the first `.` after the prefix splits a name back into exactly one pair.
//! Anything outside those alphabets is rejected instead of rewritten.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;

pub const STACK_PREFIX: &str = "tenant-";
pub const MAX_STACK_NAME_LEN: usize = 100;

static ACCOUNT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$").expect("account id pattern is valid")
});

static RESOURCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("resource id pattern is valid"));

pub fn validate_account_id(account_id: &str) -> Result<(), ValidationError> {
    if account_id.trim().is_empty() {
        return Err(ValidationError::Missing {
            field: "account_id",
        });
    }
    if !ACCOUNT_ID.is_match(account_id) {
        return Err(ValidationError::Malformed {
            field: "account_id",
            reason: "expected 6-30 lowercase letters, digits or hyphens, starting with a letter"
                .to_string(),
        });
    }
    Ok(())
}

pub fn validate_resource_id(resource_id: &str) -> Result<(), ValidationError> {
    if resource_id.trim().is_empty() {
        return Err(ValidationError::Missing {
            field: "resource_id",
        });
    }
    if !RESOURCE_ID.is_match(resource_id) {
        return Err(ValidationError::Malformed {
            field: "resource_id",
            reason: "expected letters, digits, underscores or hyphens".to_string(),
        });
    }
    Ok(())
}

pub fn compute_stack_name(account_id: &str, resource_id: &str) -> Result<String, ValidationError> {
    validate_account_id(account_id)?;
    validate_resource_id(resource_id)?;

    let name = format!("{STACK_PREFIX}{account_id}.{resource_id}");
    if name.len() > MAX_STACK_NAME_LEN {
        return Err(ValidationError::NameTooLong {
            account_id: account_id.to_string(),
            resource_id: resource_id.to_string(),
            length: name.len(),
            max: MAX_STACK_NAME_LEN,
        });
    }
    Ok(name)
}

/// Inverse of [`compute_stack_name`]; `None` for names this module did not produce.
pub fn parse_stack_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(STACK_PREFIX)?;
    let (account_id, resource_id) = rest.split_once('.')?;
    if validate_account_id(account_id).is_err() || validate_resource_id(resource_id).is_err() {
        return None;
    }
    Some((account_id, resource_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn name_for_simple_pair() {
        assert_eq!(
            compute_stack_name("proj-1", "ds-1").expect("valid"),
            "tenant-proj-1.ds-1"
        );
    }

    #[test]
    fn rejects_separator_characters_instead_of_rewriting() {
        assert!(matches!(
            compute_stack_name("proj-a", "ds.b"),
            Err(ValidationError::Malformed {
                field: "resource_id",
                ..
            })
        ));
        assert!(matches!(
            compute_stack_name("proj-a", "ds/b"),
            Err(ValidationError::Malformed { .. })
        ));
        assert!(matches!(
            compute_stack_name("example.com:proj", "ds"),
            Err(ValidationError::Malformed {
                field: "account_id",
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_and_short_ids() {
        assert_eq!(
            compute_stack_name("", "ds"),
            Err(ValidationError::Missing {
                field: "account_id"
            })
        );
        assert_eq!(
            compute_stack_name("proj-1x", "  "),
            Err(ValidationError::Missing {
                field: "resource_id"
            })
        );
        assert!(compute_stack_name("abc", "ds").is_err());
        assert!(compute_stack_name("project-", "ds").is_err());
    }

    #[test]
    fn rejects_names_over_the_engine_limit() {
        let resource = "d".repeat(90);
        let err = compute_stack_name("my-project", &resource).expect_err("too long");
        assert!(matches!(err, ValidationError::NameTooLong { max: 100, .. }));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_stack_name("dev"), None);
        assert_eq!(parse_stack_name("tenant-proj-a-ds-b"), None);
        assert_eq!(parse_stack_name("tenant-proj-a.ds.b"), None);
        assert_eq!(
            parse_stack_name("tenant-proj-a1.ds_b"),
            Some(("proj-a1", "ds_b"))
        );
    }

    proptest! {
        #[test]
        fn names_are_deterministic_and_invertible(
            account in "[a-z][a-z0-9-]{4,28}[a-z0-9]",
            resource in "[A-Za-z0-9_-]{1,40}",
        ) {
            let first = compute_stack_name(&account, &resource).expect("valid pair");
            let second = compute_stack_name(&account, &resource).expect("valid pair");
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(parse_stack_name(&first), Some((account.as_str(), resource.as_str())));
        }

        #[test]
        fn distinct_pairs_never_collide(
            a in ("[a-z][a-z0-9-]{4,10}[a-z0-9]", "[A-Za-z0-9_-]{1,8}"),
            b in ("[a-z][a-z0-9-]{4,10}[a-z0-9]", "[A-Za-z0-9_-]{1,8}"),
        ) {
            prop_assume!(a != b);
            let left = compute_stack_name(&a.0, &a.1).expect("valid pair");
            let right = compute_stack_name(&b.0, &b.1).expect("valid pair");
            prop_assert_ne!(left, right);
        }
    }
}
