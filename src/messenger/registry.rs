//! Message-type registry (spec.md §4.2 "Validation").

use serde_json::Value;
use std::collections::HashMap;

/// Required top-level fields per registered message type.
pub struct MessageTypeRegistry {
    schemas: HashMap<String, Vec<String>>,
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        let mut schemas = HashMap::new();
        schemas.insert("TASK_ASSIGNMENT".to_string(), vec!["task_description".to_string(), "priority".to_string()]);
        schemas.insert("DATA_REQUEST".to_string(), vec!["data_type".to_string(), "query_parameters".to_string()]);
        schemas.insert("ANNOUNCE".to_string(), vec![]);
        schemas.insert("STATUS_UPDATE".to_string(), vec![]);
        schemas.insert("NOTIFICATION".to_string(), vec![]);
        schemas.insert("DECISION_REQUEST".to_string(), vec![]);
        schemas.insert("VOTE_REQUEST".to_string(), vec![]);
        Self { schemas }
    }
}

impl MessageTypeRegistry {
    pub fn validate_message_type(&self, message_type: &str) -> bool {
        self.schemas.contains_key(message_type)
    }

    pub fn get_type_schema(&self, message_type: &str) -> Option<Vec<String>> {
        self.schemas.get(message_type).cloned()
    }

    pub fn list_supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.schemas.keys().cloned().collect();
        types.sort();
        types
    }

    /// Checks that `content` is a structured object carrying every field
    /// the type's schema requires.
    pub fn validate_content(&self, message_type: &str, content: &Value) -> Result<(), String> {
        let Some(required) = self.get_type_schema(message_type) else {
            return Err(format!("unknown message type: {message_type}"));
        };
        let Some(obj) = content.as_object() else {
            return Err("content must be a structured object".to_string());
        };
        for field in required {
            if !obj.contains_key(&field) {
                return Err(format!("{message_type} requires field '{field}'"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_type() {
        let registry = MessageTypeRegistry::default();
        assert!(!registry.validate_message_type("NOT_A_TYPE"));
    }

    #[test]
    fn task_assignment_requires_its_fields() {
        let registry = MessageTypeRegistry::default();
        let content = serde_json::json!({"task_description": "x"});
        assert!(registry.validate_content("TASK_ASSIGNMENT", &content).is_err());
        let content = serde_json::json!({"task_description": "x", "priority": 3});
        assert!(registry.validate_content("TASK_ASSIGNMENT", &content).is_ok());
    }
}
