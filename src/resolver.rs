use serde_json::Value;
use tracing::debug;

use crate::domain::{
    ACCESSION_PROP, ALIASES_PROP, IdentifierKind, MD5SUM_PROP, Payload, RecordIdentity,
    UUID_PROP, string_values,
};
use crate::error::SubmitError;
use crate::portal::{Frame, PortalClient};
use crate::schema::Schema;

/// What to look a record up by.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Identifier(&'a RecordIdentity),
    Payload(&'a Payload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub identity: RecordIdentity,
    /// The portal's own path for the record (`@id`), used as the PATCH target.
    pub canonical_id: String,
    pub record: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(ResolvedRecord),
    NotFound,
    Ambiguous {
        lookup: String,
        candidates: Vec<String>,
    },
}

impl Resolution {
    pub fn found(&self) -> Option<&ResolvedRecord> {
        match self {
            Resolution::Found(resolved) => Some(resolved),
            _ => None,
        }
    }

    /// Turns `Ambiguous` into an error; never picks one of the candidates.
    pub fn into_result(self) -> Result<Option<ResolvedRecord>, SubmitError> {
        match self {
            Resolution::Found(resolved) => Ok(Some(resolved)),
            Resolution::NotFound => Ok(None),
            Resolution::Ambiguous { lookup, candidates } => {
                Err(SubmitError::AmbiguousRecord { lookup, candidates })
            }
        }
    }
}

pub struct RecordResolver<'a, P: PortalClient + ?Sized> {
    portal: &'a P,
}

impl<'a, P: PortalClient + ?Sized> RecordResolver<'a, P> {
    pub fn new(portal: &'a P) -> Self {
        Self { portal }
    }

    pub fn resolve(&self, schema: &Schema, lookup: Lookup<'_>) -> Result<Resolution, SubmitError> {
        match lookup {
            Lookup::Identifier(identity) => self.resolve_identifier(identity),
            Lookup::Payload(payload) => self.resolve_payload(schema, payload),
        }
    }

    fn resolve_identifier(&self, identity: &RecordIdentity) -> Result<Resolution, SubmitError> {
        debug!(identifier = identity.as_str(), kind = %identity.kind, "resolving identifier");
        match self.portal.get(identity.as_str(), Some(Frame::Object))? {
            Some(record) => Ok(Resolution::Found(ResolvedRecord {
                identity: identity.clone(),
                canonical_id: canonical_id(&record).unwrap_or_else(|| identity.id.clone()),
                record,
            })),
            None => Ok(Resolution::NotFound),
        }
    }

    fn resolve_payload(&self, schema: &Schema, payload: &Payload) -> Result<Resolution, SubmitError> {
        for property in schema.identifying_properties() {
            let values = payload.get(&property).map(string_values).unwrap_or_default();
            if values.is_empty() {
                continue;
            }
            // Distinct records across every value of this property, first hit kept per record.
            let mut hits: Vec<(String, String, Value)> = Vec::new();
            for value in &values {
                for record in self.lookup(schema, &property, value)? {
                    let Some(id) = canonical_id(&record) else {
                        continue;
                    };
                    if !hits.iter().any(|(known, _, _)| *known == id) {
                        hits.push((id, value.clone(), record));
                    }
                }
            }
            debug!(property = property.as_str(), hits = hits.len(), "identifying property looked up");
            match hits.len() {
                0 => continue,
                1 => {
                    let Some((canonical_id, value, record)) = hits.pop() else {
                        continue;
                    };
                    return Ok(Resolution::Found(ResolvedRecord {
                        identity: RecordIdentity {
                            kind: kind_for_property(&property, &value),
                            id: value,
                        },
                        canonical_id,
                        record,
                    }));
                }
                _ => {
                    return Ok(Resolution::Ambiguous {
                        lookup: format!("{property}={}", values.join(",")),
                        candidates: hits.into_iter().map(|(id, _, _)| id).collect(),
                    });
                }
            }
        }
        Ok(Resolution::NotFound)
    }

    /// Unique keys are read directly, so a record written moments ago is already visible.
    /// Other identifying properties go through search.
    fn lookup(
        &self,
        schema: &Schema,
        property: &str,
        value: &str,
    ) -> Result<Vec<Value>, SubmitError> {
        if let Some(key) = unique_key(property, value) {
            let record = self.portal.get(&key, Some(Frame::Object))?;
            // Unique keys span every profile; a hit of another type is not this record.
            return Ok(record.into_iter().filter(|record| has_type(record, schema)).collect());
        }
        let query = vec![
            ("type".to_string(), schema.type_name().to_string()),
            (property.to_string(), value.to_string()),
            ("frame".to_string(), Frame::Object.as_str().to_string()),
        ];
        self.portal.search(&query)
    }
}

/// Path under which the portal serves a record by one of its unique keys.
fn unique_key(property: &str, value: &str) -> Option<String> {
    match property {
        ACCESSION_PROP | UUID_PROP | ALIASES_PROP => Some(value.to_string()),
        MD5SUM_PROP => Some(format!("md5:{value}")),
        _ => None,
    }
}

fn has_type(record: &Value, schema: &Schema) -> bool {
    match record.get("@type").and_then(Value::as_array) {
        Some(types) => types.iter().any(|name| name == schema.type_name()),
        None => true,
    }
}

fn canonical_id(record: &Value) -> Option<String> {
    record
        .get("@id")
        .or_else(|| record.get(UUID_PROP))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn kind_for_property(property: &str, value: &str) -> IdentifierKind {
    match property {
        ACCESSION_PROP => IdentifierKind::Accession,
        UUID_PROP => IdentifierKind::Uuid,
        ALIASES_PROP => IdentifierKind::Alias,
        _ => IdentifierKind::classify(value),
    }
}
