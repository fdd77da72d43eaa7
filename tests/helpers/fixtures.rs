use std::sync::Arc;

use arbor::authz::engine::{Authorizer, AuthorizerOptions};
use arbor::authz::policy::parse_kdl_document;
use arbor::authz::sync::OrphanPolicy;
use arbor::authz::types::PolicyFacts;

use super::db::TestDb;

/// Org -> Repo -> Issue hierarchy with cross-resource grants and implications.
pub const ORG_REPO_ISSUE: &str = r#"
resource "Org" table="orgs" {
    actions {
        - "read"
        - "manage"
    }
    roles {
        role "owner" {
            permissions {
                - "manage"
                - "Repo:read"
            }
            implies {
                - "member"
            }
        }
        role "member" {
            permissions {
                - "read"
            }
        }
    }
}

resource "Repo" table="repos" {
    actions {
        - "read"
        - "write"
    }
    roles {
        role "reader" {
            permissions {
                - "read"
                - "Issue:read"
            }
        }
        role "maintainer" {
            permissions {
                - "write"
            }
            implies {
                - "reader"
            }
        }
    }
}

resource "Issue" table="issues" {
    actions {
        - "read"
        - "close"
    }
    roles {
        role "triager" {
            permissions {
                - "close"
            }
        }
    }
}

relationship child="Repo" parent="Org" field="org_id"
relationship child="Issue" parent="Repo" field="repo_id"
"#;

/// The same policy without the `maintainer` role.
pub const WITHOUT_MAINTAINER: &str = r#"
resource "Org" table="orgs" {
    actions {
        - "read"
        - "manage"
    }
    roles {
        role "owner" {
            permissions {
                - "manage"
                - "Repo:read"
            }
            implies {
                - "member"
            }
        }
        role "member" {
            permissions {
                - "read"
            }
        }
    }
}

resource "Repo" table="repos" {
    actions {
        - "read"
        - "write"
    }
    roles {
        role "reader" {
            permissions {
                - "read"
                - "Issue:read"
            }
        }
    }
}

resource "Issue" table="issues" {
    actions {
        - "read"
        - "close"
    }
    roles {
        role "triager" {
            permissions {
                - "close"
            }
        }
    }
}

relationship child="Repo" parent="Org" field="org_id"
relationship child="Issue" parent="Repo" field="repo_id"
"#;

/// An Org role whose only grant sits two levels down, on Issue.
pub const ORG_AUDITS_ISSUES: &str = r#"
resource "Org" table="orgs" {
    actions {
        - "read"
    }
    roles {
        role "auditor" {
            permissions {
                - "Issue:read"
            }
        }
    }
}

resource "Repo" table="repos" {
    actions {
        - "read"
    }
}

resource "Issue" table="issues" {
    actions {
        - "read"
    }
}

relationship child="Repo" parent="Org" field="org_id"
relationship child="Issue" parent="Repo" field="repo_id"
"#;

pub fn facts(kdl: &str) -> PolicyFacts {
    parse_kdl_document(kdl).expect("Failed to parse fixture policy")
}

pub fn authorizer(db: &TestDb, orphans: OrphanPolicy) -> Authorizer {
    authorizer_for(db, ORG_REPO_ISSUE, orphans)
}

pub fn authorizer_for(db: &TestDb, kdl: &str, orphans: OrphanPolicy) -> Authorizer {
    Authorizer::new(
        db.connection().clone(),
        Arc::new(facts(kdl)),
        AuthorizerOptions {
            orphans,
            ..Default::default()
        },
    )
}

/// Authorizer over the fixture policy, already compiled.
pub async fn compiled_authorizer(db: &TestDb) -> Authorizer {
    let authz = authorizer(db, OrphanPolicy::Reject);
    authz.compile().await.expect("Failed to compile fixture policy");
    authz
}
