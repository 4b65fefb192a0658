use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::debug;

use crate::domain::{ACCESSION_PROP, ALIASES_PROP, MD5SUM_PROP, SUBMITTED_FILE_PROP, UUID_PROP};
use crate::error::SubmitError;
use crate::portal::PortalClient;

pub const READ_ONLY_FLAG: &str = "readonly";
pub const NOT_SUBMITTABLE_FLAG: &str = "notSubmittable";

/// Order in which identifying properties are tried during record lookup.
pub const IDENTIFYING_PRIORITY: &[&str] = &[ACCESSION_PROP, UUID_PROP, ALIASES_PROP, MD5SUM_PROP];

/// Whole-token spellings that do not follow the profile naming rule.
const PROFILE_EXCEPTIONS: &[(&str, &str)] = &[
    ("antibodies", "antibody_lot"),
    ("antibody", "antibody_lot"),
    ("publication_datum", "publication_data"),
    ("publication_data", "publication_data"),
];

/// Irregular plurals, applied to the last `_`-separated word. Singular forms map to themselves.
const IRREGULAR_PLURALS: &[(&str, &str)] = &[
    ("analyses", "analysis"),
    ("analysis", "analysis"),
    ("series", "series"),
    ("software", "software"),
    ("data", "data"),
    ("species", "species"),
    ("matrices", "matrix"),
    ("indices", "index"),
    ("mice", "mouse"),
    ("people", "person"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredProperties {
    names: BTreeSet<String>,
    conditional: bool,
}

impl RequiredProperties {
    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn contains(&self, property: &str) -> bool {
        self.names.contains(property)
    }

    /// True when part of the requirement lives in `anyOf`/`oneOf`/`allOf`/`dependencies`
    /// sub-schemas and is not reflected in `names`.
    pub fn is_conditional(&self) -> bool {
        self.conditional
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    type_name: String,
    document: Value,
}

impl Schema {
    pub fn from_document(type_name: &str, document: Value) -> Self {
        let name = document
            .get("id")
            .and_then(Value::as_str)
            .map(|id| {
                id.rsplit('/')
                    .next()
                    .unwrap_or(id)
                    .trim_end_matches(".json")
                    .to_string()
            })
            .unwrap_or_else(|| snake_case(type_name));
        Self {
            name,
            type_name: type_name.to_string(),
            document,
        }
    }

    /// Singular profile id, e.g. `genetic_modification`. New records are POSTed to this path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Portal type name used in searches, e.g. `GeneticModification`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.document.get("properties").and_then(|props| props.get(name))
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.document
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn property_type(&self, name: &str) -> Option<&str> {
        self.property(name)
            .and_then(|prop| prop.get("type"))
            .and_then(Value::as_str)
    }

    pub fn required_properties(&self) -> RequiredProperties {
        let names = self
            .document
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        let conditional = ["anyOf", "oneOf", "allOf", "dependencies", "dependentSchemas"]
            .iter()
            .filter_map(|key| self.document.get(*key))
            .any(mentions_required);
        RequiredProperties { names, conditional }
    }

    /// Identifying properties declared by the schema, ordered by lookup priority.
    pub fn identifying_properties(&self) -> Vec<String> {
        let declared: Vec<String> = self
            .document
            .get("identifyingProperties")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let mut ordered: Vec<String> = IDENTIFYING_PRIORITY
            .iter()
            .filter(|name| declared.iter().any(|d| d == *name))
            .map(|name| name.to_string())
            .collect();
        for name in declared {
            if !ordered.contains(&name) {
                ordered.push(name);
            }
        }
        ordered
    }

    pub fn is_writable(&self, name: &str) -> bool {
        match self.property(name) {
            Some(prop) => !flag_set(prop, READ_ONLY_FLAG) && !flag_set(prop, NOT_SUBMITTABLE_FLAG),
            None => true,
        }
    }

    pub fn non_writable_properties(&self) -> BTreeSet<String> {
        self.property_names()
            .into_iter()
            .filter(|name| !self.is_writable(name))
            .map(str::to_string)
            .collect()
    }

    /// Records of this profile describe a file that lives in the object store.
    pub fn expects_file(&self) -> bool {
        self.has_property(SUBMITTED_FILE_PROP)
    }
}

fn flag_set(prop: &Value, flag: &str) -> bool {
    match prop.get(flag) {
        Some(Value::Bool(value)) => *value,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

fn mentions_required(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, inner)| key == "required" || mentions_required(inner)),
        Value::Array(items) => items.iter().any(mentions_required),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: OnceLock<Arc<BTreeMap<String, Arc<Schema>>>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from an already fetched `/profiles/` document.
    pub fn from_profiles(profiles: &Value) -> Result<Self, SubmitError> {
        let catalog = Self::new();
        let _ = catalog.schemas.set(Arc::new(index_profiles(profiles)?));
        Ok(catalog)
    }

    pub fn resolve<P>(&self, portal: &P, token: &str) -> Result<Arc<Schema>, SubmitError>
    where
        P: PortalClient + ?Sized,
    {
        let schemas = self.schemas(portal)?;
        let profile_id = normalize_profile_token(token);
        schemas
            .get(&profile_id)
            .cloned()
            .ok_or_else(|| SubmitError::UnknownProfile(token.to_string()))
    }

    fn schemas<P>(&self, portal: &P) -> Result<Arc<BTreeMap<String, Arc<Schema>>>, SubmitError>
    where
        P: PortalClient + ?Sized,
    {
        if let Some(schemas) = self.schemas.get() {
            return Ok(schemas.clone());
        }
        debug!("fetching profiles from portal");
        let profiles = portal
            .get("profiles", None)?
            .ok_or_else(|| SubmitError::MalformedResponse("portal has no profiles".to_string()))?;
        let index = Arc::new(index_profiles(&profiles)?);
        debug!(count = index.len(), "profiles cached");
        Ok(self.schemas.get_or_init(|| index).clone())
    }
}

fn index_profiles(profiles: &Value) -> Result<BTreeMap<String, Arc<Schema>>, SubmitError> {
    let map = profiles
        .as_object()
        .ok_or_else(|| SubmitError::MalformedResponse("profiles is not an object".to_string()))?;
    Ok(map
        .iter()
        // `_subtypes` and `@type` are not profiles.
        .filter(|(key, value)| !key.starts_with('_') && !key.starts_with('@') && value.is_object())
        .map(|(type_name, document)| {
            let schema = Schema::from_document(type_name, document.clone());
            (schema.name().to_string(), Arc::new(schema))
        })
        .collect())
}

/// Reduces any accepted spelling of a profile reference to its singular snake_case id.
pub fn normalize_profile_token(token: &str) -> String {
    let mut token = token.trim();
    if let Some((_, rest)) = token.split_once("://") {
        token = rest.split_once('/').map(|(_, path)| path).unwrap_or("");
    }
    let token = token.trim_matches('/');
    let token = token.strip_prefix("profiles/").unwrap_or(token);
    let head = token.split('/').next().unwrap_or_default();
    let head = head.strip_suffix(".json").unwrap_or(head);
    singularize(&snake_case(head).replace('-', "_"))
}

pub fn singularize(word: &str) -> String {
    let word = word.to_ascii_lowercase();
    if let Some((_, singular)) = PROFILE_EXCEPTIONS.iter().find(|(from, _)| *from == word) {
        return singular.to_string();
    }
    let (head, last) = match word.rsplit_once('_') {
        Some((head, last)) => (Some(head), last),
        None => (None, word.as_str()),
    };
    let last = singularize_word(last);
    match head {
        Some(head) => format!("{head}_{last}"),
        None => last,
    }
}

fn singularize_word(word: &str) -> String {
    if let Some((_, singular)) = IRREGULAR_PLURALS.iter().find(|(from, _)| *from == word) {
        return singular.to_string();
    }
    if word.len() > 3 && word.ends_with("ies") {
        return format!("{}y", &word[..word.len() - 3]);
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes", "uses"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        return word.to_string();
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

/// `GeneticModification` -> `genetic_modification`; already snake_case input is returned lowercased.
pub fn snake_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    let mut prev_lower = false;
    for ch in value.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn singularize_regular_plurals() {
        assert_eq!(singularize("biosamples"), "biosample");
        assert_eq!(singularize("genetic_modifications"), "genetic_modification");
        assert_eq!(singularize("libraries"), "library");
        assert_eq!(singularize("quality_metrics"), "quality_metric");
        assert_eq!(singularize("sources"), "source");
        assert_eq!(singularize("batches"), "batch");
    }

    #[test]
    fn singularize_is_idempotent_on_singulars() {
        for name in [
            "biosample",
            "file",
            "library",
            "access_key",
            "analysis",
            "status",
            "process",
            "software",
            "antibody_lot",
            "publication_data",
        ] {
            assert_eq!(singularize(name), name, "{name}");
        }
    }

    #[test]
    fn singularize_exceptions() {
        assert_eq!(singularize("antibodies"), "antibody_lot");
        assert_eq!(singularize("antibody"), "antibody_lot");
        assert_eq!(singularize("publication_data"), "publication_data");
        assert_eq!(singularize("publication_datum"), "publication_data");
        assert_eq!(singularize("analyses"), "analysis");
        assert_eq!(singularize("computational_analyses"), "computational_analysis");
        assert_eq!(
            singularize("functional_characterization_series"),
            "functional_characterization_series"
        );
        assert_eq!(singularize("software"), "software");
        assert_eq!(singularize("data"), "data");
        assert_eq!(singularize("species"), "species");
        assert_eq!(singularize("matrices"), "matrix");
        assert_eq!(singularize("indices"), "index");
        assert_eq!(singularize("mice"), "mouse");
        assert_eq!(singularize("people"), "person");
    }

    #[test]
    fn normalize_tokens() {
        assert_eq!(normalize_profile_token("biosample"), "biosample");
        assert_eq!(normalize_profile_token("Biosample"), "biosample");
        assert_eq!(
            normalize_profile_token("GeneticModification"),
            "genetic_modification"
        );
        assert_eq!(
            normalize_profile_token("genetic-modifications"),
            "genetic_modification"
        );
        assert_eq!(
            normalize_profile_token("/profiles/biosample.json"),
            "biosample"
        );
        assert_eq!(
            normalize_profile_token("https://www.encodeproject.org/profiles/file.json"),
            "file"
        );
        assert_eq!(
            normalize_profile_token("/antibodies/ENCAB719MQZ/"),
            "antibody_lot"
        );
    }

    fn biosample_schema() -> Schema {
        Schema::from_document(
            "Biosample",
            json!({
                "id": "/profiles/biosample.json",
                "required": ["award", "lab", "source", "biosample_ontology"],
                "identifyingProperties": ["uuid", "accession", "aliases"],
                "properties": {
                    "accession": {"type": "string", "serverDefault": "accession", "permission": "import_items"},
                    "uuid": {"type": "string"},
                    "aliases": {"type": "array"},
                    "award": {"type": "string"},
                    "lab": {"type": "string"},
                    "source": {"type": "string"},
                    "biosample_ontology": {"type": "string"},
                    "date_created": {"type": "string", "readonly": true},
                    "submitted_by": {"type": "string", "notSubmittable": true}
                }
            }),
        )
    }

    #[test]
    fn schema_facts() {
        let schema = biosample_schema();
        assert_eq!(schema.name(), "biosample");
        assert_eq!(schema.type_name(), "Biosample");
        let required = schema.required_properties();
        assert!(!required.is_conditional());
        assert!(required.contains("lab"));
        assert_eq!(required.names().len(), 4);
        assert_eq!(
            schema.identifying_properties(),
            vec!["accession", "uuid", "aliases"]
        );
        assert_eq!(
            schema.non_writable_properties().into_iter().collect::<Vec<_>>(),
            vec!["date_created", "submitted_by"]
        );
        assert_eq!(schema.property_type("aliases"), Some("array"));
        assert!(!schema.expects_file());
    }

    #[test]
    fn conditional_requirements_are_flagged() {
        let schema = Schema::from_document(
            "File",
            json!({
                "id": "/profiles/file.json",
                "anyOf": [
                    {"required": ["external_accession"]},
                    {"required": ["md5sum"]}
                ],
                "properties": {"submitted_file_name": {"type": "string"}}
            }),
        );
        let required = schema.required_properties();
        assert!(required.names().is_empty());
        assert!(required.is_conditional());
        assert!(schema.expects_file());

        let schema = Schema::from_document("Lab", json!({"properties": {}}));
        let required = schema.required_properties();
        assert!(required.names().is_empty());
        assert!(!required.is_conditional());
        assert_eq!(schema.name(), "lab");
    }

    #[test]
    fn catalog_skips_private_entries() {
        let profiles = json!({
            "Biosample": {"id": "/profiles/biosample.json", "properties": {}},
            "_subtypes": {"Item": ["Biosample"]},
            "@type": ["JSONSchemas"]
        });
        let catalog = SchemaCatalog::from_profiles(&profiles).unwrap();
        let schemas = catalog.schemas.get().unwrap();
        assert_eq!(schemas.keys().collect::<Vec<_>>(), vec!["biosample"]);
    }
}
