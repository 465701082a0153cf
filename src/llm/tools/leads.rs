use super::ToolError;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};

const COST_PER_LEAD: u32 = 10;
const SETUP_FEE: u32 = 399;

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ToolError::InvalidParameters(format!("Missing required '{}' parameter", key)))
}

/// Whether callback leads can be generated for a type/region pair
pub fn check_lead_availability(arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
    Box::pin(async move {
        let lead_type = required_str(&arguments, "lead_type")?;
        let region = required_str(&arguments, "region")?;

        log::info!("Tool: checking {} leads in {}", lead_type, region);

        Ok(json!({
            "lead_type": lead_type,
            "region": region,
            "available": true,
            "cost_per_lead": COST_PER_LEAD,
            "setup_fee": SETUP_FEE,
        })
        .to_string())
    })
}

/// Book a callback with an expert
pub fn schedule_callback(arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
    Box::pin(async move {
        let callback_time = required_str(&arguments, "callback_time")?;
        let phone_number = required_str(&arguments, "phone_number")?;

        let digits = phone_number.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 10 {
            return Err(ToolError::InvalidParameters(format!(
                "'{}' is not a full phone number",
                phone_number
            )));
        }

        let confirmation = uuid::Uuid::new_v4().simple().to_string();
        log::info!(
            "Tool: callback booked for {} at {} ({})",
            phone_number,
            callback_time,
            confirmation
        );

        Ok(json!({
            "status": "scheduled",
            "callback_time": callback_time,
            "phone_number": phone_number,
            "lead_type": arguments.get("lead_type").and_then(|v| v.as_str()),
            "confirmation": &confirmation[..8],
            "booked_at": Utc::now().to_rfc3339(),
            "sms_confirmation": true,
        })
        .to_string())
    })
}
