use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobs::TransformationJob;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job: TransformationJob,
    pub provider: String,
    pub credits_charged: u64,
    pub balance_after: u64,
    #[serde(default)]
    pub poll_attempts: u32,
}

pub fn build_receipt(
    receipt: &JobReceipt,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "job".to_string(),
        sanitize_payload(&serde_json::to_value(&receipt.job).unwrap_or(Value::Null)),
    );
    root.insert(
        "provider".to_string(),
        Value::String(receipt.provider.clone()),
    );
    root.insert(
        "simulated".to_string(),
        Value::Bool(receipt.job.is_simulated()),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );

    let mut credits = Map::new();
    credits.insert(
        "charged".to_string(),
        Value::Number(receipt.credits_charged.into()),
    );
    credits.insert(
        "balance_after".to_string(),
        Value::Number(receipt.balance_after.into()),
    );
    root.insert("credits".to_string(), Value::Object(credits));
    root.insert(
        "poll_attempts".to_string(),
        Value::Number(receipt.poll_attempts.into()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "input_image" | "image_bytes" | "data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
