use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::{Error, MemberId, Result};

/// What the engine knows about one member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member_id: MemberId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Members this member is parent or guardian of.
    #[serde(default)]
    pub managed_member_ids: Vec<MemberId>,
}

/// Lookups into the surrounding membership system.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn members_with_permission(&self, permission: &str) -> Result<Vec<MemberId>>;
    async fn members_with_role(&self, role: &str) -> Result<Vec<MemberId>>;
    /// Unknown members get an empty profile.
    async fn profile(&self, member_id: MemberId) -> Result<MemberProfile>;
}

/// Directory backed by a fixed member list, optionally loaded from a JSON file of the
/// form `{"members": [MemberProfile, ...]}`.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    members: BTreeMap<MemberId, MemberProfile>,
}

#[derive(Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    members: Vec<MemberProfile>,
}

impl StaticDirectory {
    pub fn new(members: Vec<MemberProfile>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.member_id, m)).collect(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: DirectoryFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid directory file {}: {}", path.display(), e)))?;
        info!("Loaded {} members from {}", file.members.len(), path.display());
        Ok(Self::new(file.members))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl MembershipDirectory for StaticDirectory {
    async fn members_with_permission(&self, permission: &str) -> Result<Vec<MemberId>> {
        Ok(self
            .members
            .values()
            .filter(|m| m.permissions.iter().any(|p| p == permission))
            .map(|m| m.member_id)
            .collect())
    }

    async fn members_with_role(&self, role: &str) -> Result<Vec<MemberId>> {
        Ok(self
            .members
            .values()
            .filter(|m| m.roles.iter().any(|r| r == role))
            .map(|m| m.member_id)
            .collect())
    }

    async fn profile(&self, member_id: MemberId) -> Result<MemberProfile> {
        Ok(self.members.get(&member_id).cloned().unwrap_or(MemberProfile {
            member_id,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        StaticDirectory::new(vec![
            MemberProfile {
                member_id: 1,
                permissions: vec!["Warrants.approve".into()],
                roles: vec!["Crown".into()],
                ..Default::default()
            },
            MemberProfile {
                member_id: 2,
                permissions: vec!["Warrants.approve".into()],
                ..Default::default()
            },
        ])
    }

    #[tokio::test]
    async fn filters_by_permission_and_role() {
        let directory = directory();
        assert_eq!(directory.members_with_permission("Warrants.approve").await.unwrap(), vec![1, 2]);
        assert_eq!(directory.members_with_role("Crown").await.unwrap(), vec![1]);
        assert!(directory.members_with_role("Herald").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_members_have_empty_profiles() {
        let profile = directory().profile(77).await.unwrap();
        assert_eq!(profile.member_id, 77);
        assert!(profile.permissions.is_empty());
    }

    #[tokio::test]
    async fn loads_from_json_file() {
        let path = std::env::temp_dir().join(format!("directory-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"{"members": [{"member_id": 5, "roles": ["Herald"]}]}"#)
            .await
            .unwrap();
        let directory = StaticDirectory::load(&path).await.unwrap();
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.members_with_role("Herald").await.unwrap(), vec![5]);
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
