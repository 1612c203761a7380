//! `storage.Blob`: the object store as an operator.
//!
//! The first positional argument selects the function; the rest are the
//! function's own arguments, positional or by keyword.

use std::str::FromStr;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use coper_storage::BlobHandle;
use serde_json::json;
use tracing::debug;

use super::args::CallArgs;
use crate::codec::Kwargs;
use crate::error::{OperatorError, RuntimeError};
use crate::operator::{Operator, OperatorInfo, OperatorRegistry};
use crate::session::Session;
use crate::value::Value;

pub const BLOB: &str = "storage.Blob";

/// Encoding of the value returned by `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Bytes,
    Text,
    Hex,
    /// `data:<mime>;base64,<payload>` with the mime guessed from the object name.
    Base64,
}

impl FromStr for OutputFormat {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bytes" => Ok(Self::Bytes),
            "text" => Ok(Self::Text),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            other => Err(OperatorError::Argument(format!(
                "unsupported output_format '{other}' (expected bytes, text, hex or base64)"
            ))),
        }
    }
}

impl OutputFormat {
    fn render(self, object_name: &str, data: Bytes) -> Result<Value, OperatorError> {
        match self {
            Self::Bytes => Ok(Value::Bytes(data.to_vec())),
            Self::Hex => Ok(Value::Str(hex::encode(&data))),
            Self::Base64 => Ok(Value::Str(format!(
                "data:{};base64,{}",
                image_mime_type(object_name),
                general_purpose::STANDARD.encode(&data)
            ))),
            Self::Text => String::from_utf8(data.to_vec())
                .map(Value::Str)
                .map_err(|e| OperatorError::Type(format!("object is not valid UTF-8: {e}"))),
        }
    }
}

/// Image mime type by file extension; anything unrecognized is treated as JPEG.
fn image_mime_type(object_name: &str) -> &'static str {
    let ext = std::path::Path::new(object_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}

pub struct BlobOperator;

fn handle_value(handle: BlobHandle) -> Value {
    Value::map([
        ("bucket", Value::Str(handle.bucket)),
        ("object_name", Value::Str(handle.object_name)),
    ])
}

fn payload(value: &Value) -> Result<Bytes, OperatorError> {
    match value {
        Value::Bytes(b) => Ok(Bytes::copy_from_slice(b)),
        Value::Str(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        other => Err(OperatorError::Type(format!("data must be bytes or str, got {}", other.type_name()))),
    }
}

fn output_format(value: Option<&Value>) -> Result<OutputFormat, OperatorError> {
    match value {
        None | Some(Value::Nil) => Ok(OutputFormat::default()),
        Some(Value::Str(s)) => s.parse(),
        Some(other) => Err(OperatorError::Type(format!("output_format must be str, got {}", other.type_name()))),
    }
}

/// `{bucket, object_name}` pulled out of a handle map.
fn file_location(file: &Value) -> Result<(&str, &str), OperatorError> {
    let field = |name: &str| {
        file.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| OperatorError::Argument(format!("file handle is missing '{name}'")))
    };
    Ok((field("bucket")?, field("object_name")?))
}

#[async_trait]
impl Operator for BlobOperator {
    async fn compute(&self, session: &Session, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, OperatorError> {
        let (function, rest) = match args.split_first() {
            Some((Value::Str(f), rest)) => (f.as_str(), rest),
            Some((other, _)) => {
                return Err(OperatorError::Type(format!(
                    "function name must be str, got {}",
                    other.type_name()
                )))
            }
            None => return Err(OperatorError::Argument("missing function name".into())),
        };
        let call = CallArgs::new(rest, &kwargs);
        let blobs = session.blobs()?;
        debug!(function, "blob operator call");

        match function {
            "write" => {
                call.expect_at_most(&["bucket", "object_name", "data"])?;
                let data = payload(call.require(2, "data")?)?;
                let handle = blobs
                    .write(call.require_str(0, "bucket")?, call.require_str(1, "object_name")?, data)
                    .await?;
                Ok(handle_value(handle))
            }
            "read" => {
                call.expect_at_most(&["bucket", "object_name", "output_format"])?;
                let format = output_format(call.get(2, "output_format"))?;
                let object_name = call.require_str(1, "object_name")?;
                match blobs.read(call.require_str(0, "bucket")?, object_name).await? {
                    Some(data) => format.render(object_name, data),
                    None => Ok(Value::Nil),
                }
            }
            "delete" => {
                call.expect_at_most(&["bucket", "object_name"])?;
                let handle = blobs
                    .delete(call.require_str(0, "bucket")?, call.require_str(1, "object_name")?)
                    .await?;
                Ok(handle_value(handle))
            }
            "make_bucket" => {
                call.expect_at_most(&["bucket"])?;
                Ok(Value::Str(blobs.make_bucket(call.require_str(0, "bucket")?).await?))
            }
            "delete_bucket" => {
                call.expect_at_most(&["bucket"])?;
                Ok(Value::Str(blobs.delete_bucket(call.require_str(0, "bucket")?).await?))
            }
            "write_s3" => {
                call.expect_at_most(&["file", "data"])?;
                let (bucket, object_name) = file_location(call.require(0, "file")?)?;
                let data = payload(call.require(1, "data")?)?;
                Ok(handle_value(blobs.write(bucket, object_name, data).await?))
            }
            "read_s3" => {
                call.expect_at_most(&["file", "output_format"])?;
                let file = call.require(0, "file")?;
                let (bucket, object_name) = file_location(file)?;
                let format = output_format(call.get(1, "output_format").or_else(|| file.get("output_format")))?;
                match blobs.read(bucket, object_name).await? {
                    Some(data) => format.render(object_name, data),
                    None => Ok(Value::Nil),
                }
            }
            other => Err(OperatorError::Argument(format!("storage.Blob has no function '{other}'"))),
        }
    }
}

pub fn register(registry: &mut OperatorRegistry) -> Result<(), RuntimeError> {
    let info = OperatorInfo::new(BLOB, "Read and write objects in the session's object store").with_schemas(
        json!({
            "type": "object",
            "properties": {
                "function_name": {
                    "type": "string",
                    "enum": ["write", "read", "delete", "make_bucket", "delete_bucket", "write_s3", "read_s3"]
                },
                "bucket": { "type": "string" },
                "object_name": { "type": "string" },
                "data": { "description": "bytes or str to store" },
                "file": {
                    "type": "object",
                    "properties": {
                        "bucket": { "type": "string" },
                        "object_name": { "type": "string" }
                    }
                },
                "output_format": { "type": "string", "enum": ["bytes", "text", "hex", "base64"] }
            },
            "required": ["function_name"]
        }),
        json!({ "description": "file handle, bucket name, or object contents" }),
    );
    registry.register_stateless(info, || BlobOperator)
}
