#[derive(Clone, Copy, Debug)]
pub struct CommandSpec {
    pub kind: &'static str,
    pub example: &'static str,
}

pub const NODE_TYPES: &[&str] = &[
    "process", "input", "output", "decision", "database", "cloud", "group", "default",
];

pub const EDGE_TYPES: &[&str] = &[
    "default",
    "straight",
    "step",
    "smoothstep",
    "bezier",
    "simplebezier",
];

pub const COMMAND_CATALOG: &[CommandSpec] = &[
    CommandSpec {
        kind: "status",
        example: r#"{"type": "status", "data": {"message": "Description of current step"}}"#,
    },
    CommandSpec {
        kind: "add_node",
        example: r#"{"type": "add_node", "data": {"id": "unique_id", "nodeType": "process|input|output|decision|database|cloud|group|default", "position": {"x": 100, "y": 200}, "label": "Node Label"}}"#,
    },
    CommandSpec {
        kind: "update_node",
        example: r#"{"type": "update_node", "data": {"id": "existing_id", "changes": {"position": {"x": 100, "y": 200}, "label": "New Label", "nodeType": "new_type"}}}"#,
    },
    CommandSpec {
        kind: "delete_node",
        example: r#"{"type": "delete_node", "data": {"id": "node_to_delete"}}"#,
    },
    CommandSpec {
        kind: "add_edge",
        example: r#"{"type": "add_edge", "data": {"id": "edge_id", "source": "source_node_id", "target": "target_node_id", "edgeType": "default|straight|step|smoothstep|bezier|simplebezier"}}"#,
    },
    CommandSpec {
        kind: "update_edge",
        example: r#"{"type": "update_edge", "data": {"id": "existing_edge_id", "changes": {"edgeType": "new_type"}}}"#,
    },
    CommandSpec {
        kind: "delete_edge",
        example: r#"{"type": "delete_edge", "data": {"id": "edge_to_delete"}}"#,
    },
    CommandSpec {
        kind: "complete",
        example: r#"{"type": "complete", "data": {"message": "Edit completed successfully"}}"#,
    },
];
