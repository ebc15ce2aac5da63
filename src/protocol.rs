//! TollGate signed-event protocol
//!
//! Wire format shared by every upstream gateway:
//! - Advertisement (kind 10021): metric, step size and pricing tags
//! - Payment (kind 21000): device identifier and ecash token tags
//! - Session grant (kind 1022): authoritative allotment tag
//!
//! All inbound events are validated by recomputing the event id and checking
//! the signature against the embedded pubkey before any tag is read.

use crate::errors::{TollGateError, TollGateResult};
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, Tag};
use serde::{Deserialize, Serialize};

pub const KIND_ADVERTISEMENT: Kind = Kind::Custom(10021);
pub const KIND_PAYMENT: Kind = Kind::Custom(21000);
pub const KIND_SESSION: Kind = Kind::Custom(1022);

/// What an upstream charges for: wall-clock time or transferred data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Milliseconds,
    Bytes,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Milliseconds => "milliseconds",
            Metric::Bytes => "bytes",
        }
    }

    pub fn parse(s: &str) -> TollGateResult<Self> {
        match s {
            "milliseconds" => Ok(Metric::Milliseconds),
            "bytes" => Ok(Metric::Bytes),
            other => Err(TollGateError::UnsupportedMetric(other.to_string())),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TollGate advertisement information (parsed from kind 10021 events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub metric: Metric,
    /// Billing granularity in metric units.
    pub step_size: u64,
    /// Pricing options in the order the upstream advertised them.
    pub pricing_options: Vec<PricingOption>,
    /// TollGate's public key, hex encoded.
    pub tollgate_pubkey: String,
    /// Id of the signed advertisement event; advertisements are
    /// content-addressed through it.
    pub event_id: String,
}

/// Pricing option from advertisement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingOption {
    pub asset_type: String,
    pub price_per_step: u64,
    pub price_unit: String,
    pub mint_url: String,
    pub min_steps: u64,
}

/// Session grant parsed from a kind 1022 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionGrant {
    /// Total purchased units, absolute. The upstream is authoritative.
    pub allotment: u64,
    pub tollgate_pubkey: String,
    pub event_id: String,
}

/// One sample of the upstream's own accounting (`GET /usage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageReport {
    Active { usage: u64, allotment: u64 },
    /// `-1/-1`: the upstream no longer knows this session.
    Ended,
}

/// Parse and authenticate a raw advertisement body.
///
/// Recomputes the event id, verifies the signature and checks the kind. The
/// verified event is returned so callers can keep it alongside the extracted
/// info.
pub fn validate_advertisement_bytes(bytes: &[u8]) -> TollGateResult<Event> {
    let event = Event::from_json(bytes).map_err(|e| {
        TollGateError::InvalidAdvertisement(format!("Malformed event JSON: {}", e))
    })?;

    event.verify().map_err(|e| {
        TollGateError::InvalidAdvertisement(format!("Signature verification failed: {}", e))
    })?;

    if event.kind != KIND_ADVERTISEMENT {
        return Err(TollGateError::InvalidAdvertisement(format!(
            "Expected kind 10021, got {}",
            event.kind.as_u16()
        )));
    }

    Ok(event)
}

/// Extract metric, step size and pricing options from a verified
/// advertisement event.
pub fn extract_advertisement_info(event: &Event) -> TollGateResult<Advertisement> {
    let mut metric = None;
    let mut step_size = None;
    let mut pricing_options = Vec::new();

    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.is_empty() {
            continue;
        }

        match values[0].as_str() {
            "metric" => {
                if values.len() >= 2 {
                    metric = Some(Metric::parse(&values[1])?);
                }
            }
            "step_size" => {
                if values.len() >= 2 {
                    step_size = values[1].parse::<u64>().ok();
                }
            }
            "price_per_step" => {
                // ["price_per_step", "cashu", "210", "sat", "https://mint.url", "1"]
                if values.len() >= 6 {
                    pricing_options.push(PricingOption {
                        asset_type: values[1].clone(),
                        price_per_step: values[2].parse::<u64>().unwrap_or(0),
                        price_unit: values[3].clone(),
                        mint_url: values[4].clone(),
                        min_steps: values[5].parse::<u64>().unwrap_or(1),
                    });
                }
            }
            _ => {} // Ignore unknown tags
        }
    }

    Ok(Advertisement {
        metric: metric.ok_or_else(|| {
            TollGateError::InvalidAdvertisement("Missing metric".to_string())
        })?,
        step_size: step_size.ok_or_else(|| {
            TollGateError::InvalidAdvertisement("Missing step_size".to_string())
        })?,
        pricing_options,
        tollgate_pubkey: event.pubkey.to_hex(),
        event_id: event.id.to_hex(),
    })
}

/// Sanity-check an advertisement beyond its signature.
pub fn validate_advertisement(ad: &Advertisement) -> TollGateResult<()> {
    if ad.step_size == 0 {
        return Err(TollGateError::InvalidAdvertisement(
            "Step size cannot be zero".to_string(),
        ));
    }

    if ad.pricing_options.is_empty() {
        return Err(TollGateError::InvalidAdvertisement(
            "No pricing options available".to_string(),
        ));
    }

    for option in &ad.pricing_options {
        if option.asset_type != "cashu" {
            return Err(TollGateError::InvalidAdvertisement(format!(
                "Unsupported asset type: {}",
                option.asset_type
            )));
        }

        if option.price_per_step == 0 {
            return Err(TollGateError::InvalidAdvertisement(
                "Price per step cannot be zero".to_string(),
            ));
        }
    }

    Ok(())
}

/// Build and sign a payment event (kind 21000) with the session's ephemeral
/// customer keys.
pub fn build_payment_event(
    tollgate_pubkey: &str,
    mac_address: &str,
    payment_token: &str,
    customer_keys: &Keys,
) -> TollGateResult<Event> {
    let tags = vec![
        Tag::parse(vec!["p".to_string(), tollgate_pubkey.to_string()])
            .map_err(|e| TollGateError::protocol(format!("Invalid pubkey tag: {}", e)))?,
        Tag::parse(vec![
            "device-identifier".to_string(),
            "mac".to_string(),
            mac_address.to_string(),
        ])
        .map_err(|e| TollGateError::protocol(format!("Invalid device-identifier tag: {}", e)))?,
        Tag::parse(vec!["payment".to_string(), payment_token.to_string()])
            .map_err(|e| TollGateError::protocol(format!("Invalid payment tag: {}", e)))?,
    ];

    let event = EventBuilder::new(KIND_PAYMENT, "")
        .tags(tags)
        .sign_with_keys(customer_keys)?;

    Ok(event)
}

/// Parse and authenticate a session response (kind 1022).
pub fn parse_session_event(bytes: &[u8]) -> TollGateResult<SessionGrant> {
    let event = Event::from_json(bytes)
        .map_err(|e| TollGateError::protocol(format!("Malformed session event: {}", e)))?;

    event
        .verify()
        .map_err(|e| TollGateError::protocol(format!("Session event signature invalid: {}", e)))?;

    if event.kind != KIND_SESSION {
        return Err(TollGateError::protocol(format!(
            "Expected kind 1022, got {}",
            event.kind.as_u16()
        )));
    }

    let mut allotment = None;
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.len() >= 2 && values[0] == "allotment" {
            allotment = values[1].parse::<u64>().ok();
        }
    }

    Ok(SessionGrant {
        allotment: allotment.ok_or_else(|| {
            TollGateError::protocol("Missing allotment in session response")
        })?,
        tollgate_pubkey: event.pubkey.to_hex(),
        event_id: event.id.to_hex(),
    })
}

/// Parse the plaintext `usage/allotment` body of `GET /usage`.
pub fn parse_usage_report(body: &str) -> TollGateResult<UsageReport> {
    let (usage, allotment) = body
        .trim()
        .split_once('/')
        .ok_or_else(|| TollGateError::protocol(format!("Malformed usage report: {:?}", body)))?;

    if usage.trim() == "-1" && allotment.trim() == "-1" {
        return Ok(UsageReport::Ended);
    }

    let usage = usage
        .trim()
        .parse::<u64>()
        .map_err(|e| TollGateError::protocol(format!("Bad usage value: {}", e)))?;
    let allotment = allotment
        .trim()
        .parse::<u64>()
        .map_err(|e| TollGateError::protocol(format!("Bad allotment value: {}", e)))?;

    Ok(UsageReport::Active { usage, allotment })
}

/// Total cost for a purchase.
pub fn calculate_cost(option: &PricingOption, steps: u64) -> u64 {
    steps * option.price_per_step
}

/// Units granted for a purchase.
pub fn calculate_allotment(steps: u64, step_size: u64) -> u64 {
    steps * step_size
}


#[cfg(test)]
mod tests {
    use super::testing::{signed_advertisement, signed_session_grant};
    use super::*;

    #[test]
    fn test_validate_and_extract_advertisement() {
        let keys = Keys::generate();
        let event = signed_advertisement(&keys, "milliseconds", 60000);
        let bytes = event.as_json().into_bytes();

        let verified = validate_advertisement_bytes(&bytes).unwrap();
        let ad = extract_advertisement_info(&verified).unwrap();

        assert_eq!(ad.metric, Metric::Milliseconds);
        assert_eq!(ad.step_size, 60000);
        assert_eq!(ad.tollgate_pubkey, keys.public_key().to_hex());
        assert_eq!(ad.pricing_options.len(), 1);
        assert_eq!(ad.pricing_options[0].price_per_step, 1);
        assert_eq!(ad.pricing_options[0].min_steps, 0);
        assert!(validate_advertisement(&ad).is_ok());
    }

    #[test]
    fn test_tampered_advertisement_rejected() {
        let keys = Keys::generate();
        let event = signed_advertisement(&keys, "milliseconds", 60000);
        let tampered = event.as_json().replace("60000", "1");

        assert!(validate_advertisement_bytes(tampered.as_bytes()).is_err());
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::Custom(1), "")
            .sign_with_keys(&keys)
            .unwrap();

        assert!(validate_advertisement_bytes(event.as_json().as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let keys = Keys::generate();
        let event = signed_advertisement(&keys, "packets", 1000);
        let verified = validate_advertisement_bytes(&event.as_json().into_bytes()).unwrap();

        assert!(matches!(
            extract_advertisement_info(&verified),
            Err(TollGateError::UnsupportedMetric(_))
        ));
    }

    #[test]
    fn test_payment_event_shape() {
        let customer = Keys::generate();
        let event = build_payment_event(
            "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49",
            "aa:bb:cc:dd:ee:ff",
            "cashuAeyJ0b2tlbiI6W10=",
            &customer,
        )
        .unwrap();

        assert_eq!(event.kind, KIND_PAYMENT);
        assert_eq!(event.pubkey, customer.public_key());
        assert!(event.verify().is_ok());

        let tag_names: Vec<&str> = event
            .tags
            .iter()
            .map(|t| t.as_slice()[0].as_str())
            .collect();
        assert!(tag_names.contains(&"p"));
        assert!(tag_names.contains(&"device-identifier"));
        assert!(tag_names.contains(&"payment"));
    }

    #[test]
    fn test_parse_session_event() {
        let keys = Keys::generate();
        let event = signed_session_grant(&keys, 600000);

        let grant = parse_session_event(event.as_json().as_bytes()).unwrap();
        assert_eq!(grant.allotment, 600000);
        assert_eq!(grant.tollgate_pubkey, keys.public_key().to_hex());
    }

    #[test]
    fn test_session_event_missing_allotment() {
        let keys = Keys::generate();
        let event = EventBuilder::new(KIND_SESSION, "")
            .sign_with_keys(&keys)
            .unwrap();

        assert!(parse_session_event(event.as_json().as_bytes()).is_err());
    }

    #[test]
    fn test_parse_usage_report() {
        assert_eq!(
            parse_usage_report("1234/600000").unwrap(),
            UsageReport::Active {
                usage: 1234,
                allotment: 600000
            }
        );
        assert_eq!(parse_usage_report("-1/-1\n").unwrap(), UsageReport::Ended);
        assert!(parse_usage_report("garbage").is_err());
    }

    #[test]
    fn test_cost_and_allotment_arithmetic() {
        let option = PricingOption {
            asset_type: "cashu".to_string(),
            price_per_step: 5,
            price_unit: "sat".to_string(),
            mint_url: "https://mint.example.com".to_string(),
            min_steps: 10,
        };

        assert_eq!(calculate_cost(&option, 100), 500);
        assert_eq!(calculate_allotment(60, 1000), 60000);
    }
}
