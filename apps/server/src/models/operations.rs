use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;

/// Where an operation was invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationScope {
    System,
    Type(String),
    Instance(String, String),
}

/// FHIR Parameters resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Vec<Parameter>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(flatten)]
    pub value: ParameterValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Resource {
        resource: JsonValue,
    },
    Parts {
        part: Vec<Parameter>,
    },
    /// FHIR JSON "value[x]" parameter content, e.g. `{ "valueString": "..." }`
    Value(HashMap<String, JsonValue>),
}

impl Parameters {
    pub fn new() -> Self {
        Self {
            resource_type: "Parameters".to_string(),
            parameter: None,
        }
    }

    /// Build a Parameters resource from URL query pairs.
    ///
    /// Query values are strings; typed readers (`get_bool`, `get_integer`)
    /// coerce them, which is what makes GET and POST invocations equivalent.
    pub fn from_query(pairs: &[(String, String)]) -> Self {
        let mut parameters = Self::new();
        for (name, value) in pairs {
            parameters.add_value_string(name.clone(), value.clone());
        }
        parameters
    }

    pub fn add_value_string(&mut self, name: String, value: String) {
        self.push_value(name, "valueString", JsonValue::String(value));
    }

    pub fn add_value_boolean(&mut self, name: String, value: bool) {
        self.push_value(name, "valueBoolean", JsonValue::Bool(value));
    }

    pub fn add_value_integer(&mut self, name: String, value: i64) {
        self.push_value(name, "valueInteger", JsonValue::Number(value.into()));
    }

    pub fn add_value_decimal(&mut self, name: String, value: f64) {
        let number = serde_json::Number::from_f64(value)
            .unwrap_or_else(|| serde_json::Number::from(0));
        self.push_value(name, "valueDecimal", JsonValue::Number(number));
    }

    pub fn add_value_code(&mut self, name: String, value: String) {
        self.push_value(name, "valueCode", JsonValue::String(value));
    }

    pub fn add_value_uri(&mut self, name: String, value: String) {
        self.push_value(name, "valueUri", JsonValue::String(value));
    }

    pub fn add_value_coding(&mut self, name: String, coding: JsonValue) {
        self.push_value(name, "valueCoding", coding);
    }

    fn push_value(&mut self, name: String, key: &str, value: JsonValue) {
        let param = Parameter {
            name,
            value: ParameterValue::Value(HashMap::from([(key.to_string(), value)])),
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn add_resource(&mut self, name: String, resource: JsonValue) {
        let param = Parameter {
            name,
            value: ParameterValue::Resource { resource },
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn add_parts(&mut self, name: String, part: Vec<Parameter>) {
        let param = Parameter {
            name,
            value: ParameterValue::Parts { part },
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameter.as_ref()?.iter().find(|p| p.name == name)
    }

    pub fn get_value(&self, name: &str) -> Option<&JsonValue> {
        match &self.get_parameter(name)?.value {
            ParameterValue::Value(map) if map.len() == 1 => map.values().next(),
            _ => None,
        }
    }

    pub fn get_values(&self, name: &str) -> Vec<&JsonValue> {
        let Some(params) = self.parameter.as_ref() else {
            return Vec::new();
        };
        params
            .iter()
            .filter(|p| p.name == name)
            .filter_map(|p| match &p.value {
                ParameterValue::Value(map) if map.len() == 1 => map.values().next(),
                _ => None,
            })
            .collect()
    }

    /// String reader, lenient about `valueString` / `valueUri` / `valueCode`
    /// / `valueCanonical`: the wire layer accepts them interchangeably.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get_value(name)?.as_str().map(|s| s.to_string())
    }

    pub fn get_strings(&self, name: &str) -> Vec<String> {
        self.get_values(name)
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    }

    /// Boolean reader, also accepting the string forms query parameters use.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get_value(name)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer reader, also accepting string forms.
    pub fn get_integer(&self, name: &str) -> Option<i64> {
        match self.get_value(name)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// A Coding-valued parameter; query invocations encode codings as
    /// `system|code`.
    pub fn get_coding(&self, name: &str) -> Option<JsonValue> {
        match self.get_value(name)? {
            JsonValue::Object(_) => Some(self.get_value(name)?.clone()),
            JsonValue::String(s) => {
                let (system, code) = s.split_once('|')?;
                Some(json!({ "system": system, "code": code }))
            }
            _ => None,
        }
    }

    pub fn get_resource(&self, name: &str) -> Option<&JsonValue> {
        match &self.get_parameter(name)?.value {
            ParameterValue::Resource { resource } => Some(resource),
            _ => None,
        }
    }

    pub fn get_resources(&self, name: &str) -> Vec<&JsonValue> {
        let Some(params) = self.parameter.as_ref() else {
            return Vec::new();
        };
        params
            .iter()
            .filter(|p| p.name == name)
            .filter_map(|p| match &p.value {
                ParameterValue::Resource { resource } => Some(resource),
                _ => None,
            })
            .collect()
    }

    pub fn all_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameter.as_deref().unwrap_or(&[]).iter()
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_round_trip_through_typed_readers() {
        let parameters = Parameters::from_query(&[
            ("system".to_string(), "http://loinc.org".to_string()),
            ("activeOnly".to_string(), "true".to_string()),
            ("count".to_string(), "25".to_string()),
        ]);
        assert_eq!(parameters.get_string("system").as_deref(), Some("http://loinc.org"));
        assert_eq!(parameters.get_bool("activeOnly"), Some(true));
        assert_eq!(parameters.get_integer("count"), Some(25));
    }

    #[test]
    fn coding_accepts_object_and_pipe_forms() {
        let mut parameters = Parameters::new();
        parameters.add_value_coding(
            "coding".to_string(),
            json!({ "system": "http://loinc.org", "code": "1963-8" }),
        );
        let coding = parameters.get_coding("coding").unwrap();
        assert_eq!(coding["code"], "1963-8");

        let parameters = Parameters::from_query(&[(
            "coding".to_string(),
            "http://loinc.org|1963-8".to_string(),
        )]);
        let coding = parameters.get_coding("coding").unwrap();
        assert_eq!(coding["system"], "http://loinc.org");
        assert_eq!(coding["code"], "1963-8");
    }

    #[test]
    fn repeated_parameters_collect_in_order() {
        let parameters = Parameters::from_query(&[
            ("property".to_string(), "parent".to_string()),
            ("property".to_string(), "child".to_string()),
        ]);
        assert_eq!(parameters.get_strings("property"), vec!["parent", "child"]);
    }

    #[test]
    fn serializes_parts_and_resources() {
        let mut parameters = Parameters::new();
        parameters.add_resource("tx-resource".to_string(), json!({ "resourceType": "ValueSet", "status": "active" }));
        parameters.add_parts(
            "match".to_string(),
            vec![Parameter {
                name: "relationship".to_string(),
                value: ParameterValue::Value(HashMap::from([(
                    "valueCode".to_string(),
                    JsonValue::String("equivalent".to_string()),
                )])),
            }],
        );
        let v = serde_json::to_value(&parameters).unwrap();
        assert_eq!(v["parameter"][0]["resource"]["resourceType"], "ValueSet");
        assert_eq!(v["parameter"][1]["part"][0]["valueCode"], "equivalent");
    }
}
