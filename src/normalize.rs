use std::fs::File;
use std::io;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ProcessDefaults;
use crate::domain::{
    ALIASES_PROP, FILE_SIZE_PROP, ID_KEY, MD5SUM_PROP, PROFILE_KEY, Payload, SUBMITTED_FILE_PROP,
    SubmitOperation, string_values,
};
use crate::error::SubmitError;
use crate::schema::Schema;

pub const RUN_TYPE_PROP: &str = "run_type";
pub const PAIRED_END_PROP: &str = "paired_end";
pub const SINGLE_ENDED: &str = "single-ended";
pub const ATTACHMENT_PROP: &str = "attachment";
const ATTACHMENT_PATH_KEY: &str = "path";

/// Keys that only route a payload on the client side.
pub const CONTROL_KEYS: &[&str] = &[PROFILE_KEY, ID_KEY, "@id"];

pub fn strip_control_keys(payload: &mut Payload) {
    for key in CONTROL_KEYS {
        payload.remove(*key);
    }
}

pub fn is_alias_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '.' | '-' | '_')
}

/// Path separators and whitespace become `_`; any other disallowed character is dropped.
pub fn clean_alias(alias: &str) -> String {
    alias
        .trim()
        .chars()
        .filter_map(|ch| match ch {
            '/' | '\\' => Some('_'),
            ch if ch.is_whitespace() => Some('_'),
            ch if is_alias_char(ch) => Some(ch),
            _ => None,
        })
        .collect()
}

/// Cleans every alias, keeping order; aliases that clean down to nothing are dropped.
pub fn clean_aliases(aliases: &[String]) -> Vec<String> {
    aliases
        .iter()
        .map(|alias| clean_alias(alias))
        .filter(|alias| !alias.is_empty())
        .collect()
}

/// Adds `prefix:` to aliases without one and drops repeats, keeping the first occurrence.
pub fn prefix_aliases(aliases: Vec<String>, prefix: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let alias = match prefix {
            Some(prefix) if !alias.contains(':') => format!("{prefix}:{alias}"),
            _ => alias,
        };
        if !out.contains(&alias) {
            out.push(alias);
        }
    }
    out
}

/// Rewrites the payload's `aliases` in place. A payload without aliases is left untouched.
pub fn normalize_aliases(payload: &mut Payload, defaults: &ProcessDefaults) {
    let Some(raw) = payload.get(ALIASES_PROP) else {
        return;
    };
    let cleaned = prefix_aliases(
        clean_aliases(&string_values(raw)),
        defaults.alias_prefix(),
    );
    payload.insert(
        ALIASES_PROP.to_string(),
        Value::Array(cleaned.into_iter().map(Value::String).collect()),
    );
}

/// Fills absent required properties from the process defaults. Returns the names filled in.
pub fn apply_defaults(
    payload: &mut Payload,
    schema: &Schema,
    defaults: &ProcessDefaults,
) -> Vec<String> {
    let mut injected = Vec::new();
    for property in schema.required_properties().names() {
        if payload.contains_key(property) {
            continue;
        }
        if let Some(value) = defaults.get(property) {
            payload.insert(property.clone(), value.clone());
            injected.push(property.clone());
        }
    }
    if !injected.is_empty() {
        debug!(profile = schema.name(), ?injected, "defaults applied");
    }
    injected
}

pub fn check_required(payload: &Payload, schema: &Schema) -> Result<(), SubmitError> {
    let required = schema.required_properties();
    if required.is_conditional() {
        debug!(
            profile = schema.name(),
            "profile has conditional requirements; only top-level ones are checked"
        );
    }
    match required
        .names()
        .iter()
        .find(|name| is_unset(payload.get(name.as_str())))
    {
        Some(property) => Err(SubmitError::MissingRequiredProperty {
            profile: schema.name().to_string(),
            property: property.clone(),
        }),
        None => Ok(()),
    }
}

pub fn check_aliases(payload: &Payload, schema: &Schema) -> Result<(), SubmitError> {
    if !schema.has_property(ALIASES_PROP) {
        return Ok(());
    }
    if is_unset(payload.get(ALIASES_PROP)) {
        return Err(SubmitError::MissingRequiredProperty {
            profile: schema.name().to_string(),
            property: ALIASES_PROP.to_string(),
        });
    }
    Ok(())
}

fn is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// PATCH bodies lose read-only and server-managed properties; POST bodies are left as is.
pub fn strip_non_writable(payload: &mut Payload, schema: &Schema, operation: SubmitOperation) {
    if operation != SubmitOperation::Patch {
        return;
    }
    payload.retain(|key, _| schema.is_writable(key));
}

/// Fills `md5sum` and `file_size` for file records whose bytes are available locally, and
/// drops `paired_end` for single-ended runs. Returns the local file path, if there is one.
pub fn apply_file_hooks(
    payload: &mut Payload,
    schema: &Schema,
    explicit_path: Option<&Utf8Path>,
) -> Result<Option<Utf8PathBuf>, SubmitError> {
    if payload.get(RUN_TYPE_PROP).and_then(Value::as_str) == Some(SINGLE_ENDED) {
        payload.remove(PAIRED_END_PROP);
    }
    if !schema.expects_file() {
        return Ok(None);
    }
    let path = match explicit_path {
        Some(path) => Some(path.to_path_buf()),
        None => payload
            .get(SUBMITTED_FILE_PROP)
            .and_then(Value::as_str)
            .map(Utf8PathBuf::from)
            .filter(|path| path.is_file()),
    };
    let Some(path) = path else {
        return Ok(None);
    };
    if !payload.contains_key(SUBMITTED_FILE_PROP) {
        payload.insert(
            SUBMITTED_FILE_PROP.to_string(),
            Value::String(path.to_string()),
        );
    }
    if !payload.contains_key(MD5SUM_PROP) {
        payload.insert(MD5SUM_PROP.to_string(), Value::String(file_md5(&path)?));
    }
    if !payload.contains_key(FILE_SIZE_PROP) {
        let size = std::fs::metadata(path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?
            .len();
        payload.insert(FILE_SIZE_PROP.to_string(), Value::from(size));
    }
    Ok(Some(path))
}

pub fn file_md5(path: &Utf8Path) -> Result<String, SubmitError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Expands `{"attachment": {"path": "<local file>"}}` into the attachment object the portal
/// stores. Any other key next to `path` is dropped.
pub fn apply_attachment(payload: &mut Payload) -> Result<(), SubmitError> {
    let Some(path) = payload
        .get(ATTACHMENT_PROP)
        .and_then(|value| value.get(ATTACHMENT_PATH_KEY))
        .and_then(Value::as_str)
        .map(Utf8PathBuf::from)
    else {
        return Ok(());
    };
    let attachment = attachment(&path)?;
    debug!(%path, "attachment embedded");
    payload.insert(ATTACHMENT_PROP.to_string(), attachment);
    Ok(())
}

pub fn attachment(path: &Utf8Path) -> Result<Value, SubmitError> {
    let bytes = std::fs::read(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?;
    let mime = mime_guess::from_path(path.as_std_path()).first_or_octet_stream();
    let mime_type = mime.essence_str();
    Ok(json!({
        "download": path.file_name().unwrap_or(path.as_str()),
        "type": mime_type,
        "href": format!("data:{mime_type};base64,{}", STANDARD.encode(&bytes)),
        "md5sum": hex::encode(Md5::digest(&bytes)),
        "size": bytes.len(),
    }))
}

/// Only optional, submittable properties the profile declares can be removed.
pub fn check_removable(schema: &Schema, property: &str) -> Result<(), SubmitError> {
    let reason = if !schema.has_property(property) {
        Some("the profile has no such property")
    } else if schema.required_properties().contains(property) {
        Some("it is required")
    } else if !schema.is_writable(property) {
        Some("it is read-only or not submittable")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SubmitError::PropertyNotRemovable {
            profile: schema.name().to_string(),
            property: property.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Full replacement body for PUT: the record's edit frame without `properties`, with `patch`
/// applied on top the way a PATCH would apply it.
pub fn replacement_body(
    current: &Value,
    properties: &[String],
    patch: Payload,
    schema: &Schema,
    extend_arrays: bool,
) -> Payload {
    let mut body = current.as_object().cloned().unwrap_or_default();
    body.retain(|key, _| !key.starts_with('@') && !properties.contains(key));
    let delta = patch_delta(patch, &Value::Object(body.clone()), schema, extend_arrays);
    body.extend(delta);
    body
}

/// Reduces a PATCH payload to the properties that differ from `current`. With `extend_arrays`
/// the array values are merged onto the record's existing lists first.
pub fn patch_delta(
    mut payload: Payload,
    current: &Value,
    schema: &Schema,
    extend_arrays: bool,
) -> Payload {
    if extend_arrays {
        for (key, value) in payload.iter_mut() {
            let is_array = matches!(value, Value::Array(_))
                && schema.property_type(key).is_none_or(|kind| kind == "array");
            if !is_array {
                continue;
            }
            if let (Some(Value::Array(existing)), Value::Array(incoming)) = (current.get(key), &*value)
            {
                let merged = merge_arrays(existing, incoming);
                *value = Value::Array(merged);
            }
        }
    }
    payload.retain(|key, value| match current.get(key) {
        Some(existing) => !same_value(existing, value),
        None => true,
    });
    payload
}

fn merge_arrays(existing: &[Value], incoming: &[Value]) -> Vec<Value> {
    let mut merged = existing.to_vec();
    for item in incoming {
        if !merged.iter().any(|known| same_value(known, item)) {
            merged.push(item.clone());
        }
    }
    merged
}

/// `/documents/abc/` and `abc` name the same linked record.
pub fn association_key(value: &str) -> &str {
    if value.starts_with('/') {
        crate::domain::last_path_segment(value)
    } else {
        value
    }
}

fn same_value(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => association_key(a) == association_key(b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_value(x, y))
        }
        _ => left == right,
    }
}
