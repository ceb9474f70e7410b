//! Inbound socket events and their payload validation.
//!
//! Each event name maps to one typed payload. Validation collects every
//! field error first, then reports the first error of each field joined into
//! one readable sentence, with the full field map attached as data.

use serde_json::{json, Map, Value};

use crate::error::SocketError;
use crate::types::EventEnvelopeIn;

pub const MAX_MESSAGE_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub content: String,
    pub resumed_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(MessagePayload),
    FetchMessages { session_id: String },
    FetchLeads { page: i64 },
}

impl InboundEvent {
    /// Validate an envelope. `Ok(None)` means the event name is not one we
    /// handle.
    pub fn parse(envelope: &EventEnvelopeIn) -> Result<Option<Self>, SocketError> {
        let event = match envelope.event.as_str() {
            "message" => {
                let (fields, mut errors) = object_fields(&envelope.data);
                let content = required_string(fields, "content", &mut errors);
                if let Some(content) = &content {
                    let chars = content.chars().count();
                    if chars == 0 {
                        errors.push("content", "Message content cannot be empty");
                    } else if chars > MAX_MESSAGE_CHARS {
                        errors.push("content", "Message content cannot exceed 255 characters");
                    }
                }
                let resumed_session = optional_bool(fields, "resumedSession", &mut errors);
                errors.into_result()?;
                InboundEvent::Message(MessagePayload {
                    content: content.unwrap_or_default(),
                    resumed_session: resumed_session.unwrap_or(false),
                })
            }
            "fetch_messages" => {
                let (fields, mut errors) = object_fields(&envelope.data);
                let session_id = required_string(fields, "sessionId", &mut errors);
                errors.into_result()?;
                InboundEvent::FetchMessages {
                    session_id: session_id.unwrap_or_default(),
                }
            }
            "fetch_leads" => {
                let (fields, mut errors) = object_fields(&envelope.data);
                let page = required_page(fields, "page", &mut errors);
                errors.into_result()?;
                InboundEvent::FetchLeads {
                    page: page.unwrap_or(1),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Message(_) => "message",
            InboundEvent::FetchMessages { .. } => "fetch_messages",
            InboundEvent::FetchLeads { .. } => "fetch_leads",
        }
    }
}

/// Field errors in the order the fields were checked.
#[derive(Debug, Default)]
pub struct FieldErrors {
    fields: Vec<(String, Vec<String>)>,
}

impl FieldErrors {
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        let message = message.into();
        match self.fields.iter_mut().find(|(name, _)| name == field) {
            Some((_, messages)) => messages.push(message),
            None => self.fields.push((field.to_string(), vec![message])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First message of each field, lowercased, joined with ". ".
    pub fn summary(&self) -> String {
        self.fields
            .iter()
            .filter_map(|(_, messages)| messages.first())
            .map(|message| message.to_lowercase())
            .filter(|message| !message.is_empty())
            .collect::<Vec<_>>()
            .join(". ")
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(field, messages)| (field.clone(), json!(messages)))
            .collect();
        Value::Object(map)
    }

    fn into_result(self) -> Result<(), SocketError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(SocketError::new(self.summary()).with_data(self.to_value()))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn object_fields(data: &Value) -> (Option<&Map<String, Value>>, FieldErrors) {
    let mut errors = FieldErrors::default();
    match data {
        Value::Object(fields) => (Some(fields), errors),
        other => {
            errors.push(
                "payload",
                format!("Expected object, received {}", type_name(other)),
            );
            (None, errors)
        }
    }
}

fn field<'a>(fields: Option<&'a Map<String, Value>>, name: &str) -> Option<&'a Value> {
    fields
        .and_then(|fields| fields.get(name))
        .filter(|value| !value.is_null())
}

fn required_string(
    fields: Option<&Map<String, Value>>,
    name: &str,
    errors: &mut FieldErrors,
) -> Option<String> {
    fields?;
    match field(fields, name) {
        None => {
            errors.push(name, "Required");
            None
        }
        Some(Value::String(value)) => Some(value.clone()),
        Some(other) => {
            errors.push(name, format!("Expected string, received {}", type_name(other)));
            None
        }
    }
}

fn optional_bool(
    fields: Option<&Map<String, Value>>,
    name: &str,
    errors: &mut FieldErrors,
) -> Option<bool> {
    match field(fields, name)? {
        Value::Bool(value) => Some(*value),
        other => {
            errors.push(name, format!("Expected boolean, received {}", type_name(other)));
            None
        }
    }
}

fn required_page(
    fields: Option<&Map<String, Value>>,
    name: &str,
    errors: &mut FieldErrors,
) -> Option<i64> {
    fields?;
    match field(fields, name) {
        None => {
            errors.push(name, "Required");
            None
        }
        Some(Value::Number(number)) => match number.as_i64() {
            Some(page) if page >= 1 => Some(page),
            Some(_) => {
                errors.push(name, "Number must be greater than 0");
                None
            }
            None => {
                errors.push(name, "Expected integer, received float");
                None
            }
        },
        Some(other) => {
            errors.push(name, format!("Expected number, received {}", type_name(other)));
            None
        }
    }
}
