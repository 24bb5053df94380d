use once_cell::sync::Lazy;
use serde_json::Value;

const REGISTRY_SCHEMA_JSON: &str = include_str!("registry.schema.json");

static REGISTRY_SCHEMA: Lazy<Value> =
    Lazy::new(|| serde_json::from_str(REGISTRY_SCHEMA_JSON).expect("valid registry schema"));

#[derive(Debug, Clone)]
pub struct DocumentValidationResult {
    pub error: Option<String>,
    pub errors: Vec<String>,
}

impl DocumentValidationResult {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

pub fn validate_registry_document(document: &Value) -> DocumentValidationResult {
    validate_document(document, &REGISTRY_SCHEMA)
}

pub fn validate_document(document: &Value, schema: &Value) -> DocumentValidationResult {
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(error) => {
            return DocumentValidationResult {
                error: Some(format!("Failed to compile registry schema: {}", error)),
                errors: vec![],
            }
        }
    };

    let errors: Vec<String> = compiled
        .validate(document)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if errors.is_empty() {
        DocumentValidationResult { error: None, errors }
    } else {
        DocumentValidationResult {
            error: Some("Registry document did not match schema.".to_string()),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::validate_registry_document;

    #[test]
    fn accepts_minimal_registry() {
        let document = serde_json::json!({
            "dimensions": [{ "key": "a", "label": "A", "weight": 1.0 }],
            "tables": [{ "name": "branches", "fields": [{ "name": "code", "type": "string" }] }]
        });
        assert!(validate_registry_document(&document).is_valid());
    }

    #[test]
    fn reports_paths_of_bad_fields() {
        let document = serde_json::json!({
            "dimensions": [{ "key": "a", "label": "A", "weight": 1.0 }],
            "tables": [{ "name": "branches", "fields": [{ "name": "code", "type": "text" }] }]
        });
        let validation = validate_registry_document(&document);
        assert!(validation.error.is_some());
        assert!(validation
            .errors
            .iter()
            .any(|error| error.starts_with("/tables/0/fields/0/type")));
    }
}
