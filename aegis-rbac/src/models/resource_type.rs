use serde::{Deserialize, Serialize};

/// Categorical tag carried by every primary entity.
///
/// Stored as plain text in the database: `user` for end-user created
/// resources, `protected` for the cloud-managed reserved range, and
/// `default` for shipped built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    User,
    Protected,
    Default,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::User => "user",
            ResourceType::Protected => "protected",
            ResourceType::Default => "default",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ResourceType::User),
            "protected" => Ok(ResourceType::Protected),
            "default" => Ok(ResourceType::Default),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}
