mod catalog;

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use catalog::{CommandSpec, COMMAND_CATALOG, EDGE_TYPES, NODE_TYPES};

/// Payload keys the typed structs do not model. Carried through untouched so a
/// forwarded command keeps everything the model wrote (styles, colors, notes).
pub type Extra = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Process,
    Input,
    Output,
    Decision,
    Database,
    Cloud,
    Group,
    #[default]
    Default,
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            "decision" => Ok(Self::Decision),
            "database" => Ok(Self::Database),
            "cloud" => Ok(Self::Cloud),
            "group" => Ok(Self::Group),
            "default" => Ok(Self::Default),
            _ => Err(format!(
                "unknown node type `{raw}`, expected one of {}",
                NODE_TYPES.join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    #[default]
    Default,
    Straight,
    Step,
    Smoothstep,
    Bezier,
    Simplebezier,
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "straight" => Ok(Self::Straight),
            "step" => Ok(Self::Step),
            "smoothstep" => Ok(Self::Smoothstep),
            "bezier" => Ok(Self::Bezier),
            "simplebezier" => Ok(Self::Simplebezier),
            _ => Err(format!(
                "unknown edge type `{raw}`, expected one of {}",
                EDGE_TYPES.join(", ")
            )),
        }
    }
}

// Models capitalize these freely (`Process`, `smoothStep`); accept any case.
fn deserialize_case_insensitive<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(de::Error::custom)
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_case_insensitive(deserializer)
    }
}

impl<'de> Deserialize<'de> for EdgeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_case_insensitive(deserializer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub message: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetId {
    pub id: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeData {
    pub id: String,
    #[serde(default)]
    pub node_type: NodeType,
    pub position: Position,
    pub label: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeData {
    pub id: String,
    pub changes: NodeChanges,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEdgeData {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub edge_type: EdgeType,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeChanges {
    pub edge_type: EdgeType,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEdgeData {
    pub id: String,
    pub changes: EdgeChanges,
    #[serde(flatten)]
    pub extra: Extra,
}

/// One diagram mutation or status/completion signal, serialized as
/// `{"type": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    Status(MessageData),
    AddNode(AddNodeData),
    UpdateNode(UpdateNodeData),
    DeleteNode(TargetId),
    AddEdge(AddEdgeData),
    UpdateEdge(UpdateEdgeData),
    DeleteEdge(TargetId),
    Complete(MessageData),
}

impl Command {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status(MessageData {
            message: message.into(),
            extra: Extra::new(),
        })
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::Complete(MessageData {
            message: message.into(),
            extra: Extra::new(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::AddNode(_) => "add_node",
            Self::UpdateNode(_) => "update_node",
            Self::DeleteNode(_) => "delete_node",
            Self::AddEdge(_) => "add_edge",
            Self::UpdateEdge(_) => "update_edge",
            Self::DeleteEdge(_) => "delete_edge",
            Self::Complete(_) => "complete",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
