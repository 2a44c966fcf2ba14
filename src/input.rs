//! Loose client payloads resolved at the boundary.
//!
//! `equipment` and `contact_person` arrive either as JSON or as a plain
//! comma-separated string. The structured form is tried first; the delimited
//! fallback only applies when the text is not JSON at all, so malformed JSON
//! (`[` or `{` prefixed) is an error rather than being split on commas.

use crate::model::ContactPerson;

/// How a loose field was written by the client.
#[derive(Debug, PartialEq)]
pub enum LooseInput<T> {
    Structured(T),
    Delimited(Vec<String>),
}

fn split_delimited(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn looks_like_json(raw: &str) -> bool {
    matches!(raw.trim_start().chars().next(), Some('[' | '{' | '"'))
}

pub fn resolve<T: serde::de::DeserializeOwned>(raw: &str) -> Result<LooseInput<T>, String> {
    if looks_like_json(raw) {
        serde_json::from_str(raw)
            .map(LooseInput::Structured)
            .map_err(|e| format!("malformed JSON: {e}"))
    } else {
        Ok(LooseInput::Delimited(split_delimited(raw)))
    }
}

/// `["projector","mic"]` or `projector, mic`.
pub fn parse_equipment(raw: &str) -> Result<Vec<String>, String> {
    let items = match resolve::<Vec<String>>(raw)? {
        LooseInput::Structured(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        LooseInput::Delimited(items) => items,
    };
    Ok(items)
}

/// `{"name":..,"phone":..,"email":..}` or `name, phone, email` (trailing parts optional).
pub fn parse_contact_person(raw: &str) -> Result<Option<ContactPerson>, String> {
    let contact = match resolve::<ContactPerson>(raw)? {
        LooseInput::Structured(c) => c,
        LooseInput::Delimited(parts) => {
            if parts.len() > 3 {
                return Err(format!(
                    "contact person takes at most name, phone, email; got {} parts",
                    parts.len()
                ));
            }
            let mut parts = parts.into_iter();
            ContactPerson {
                name: parts.next(),
                phone: parts.next(),
                email: parts.next(),
            }
        }
    };
    if contact == ContactPerson::default() {
        Ok(None)
    } else {
        Ok(Some(contact))
    }
}
