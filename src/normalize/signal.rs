//! Signal quality extraction.
//!
//! RSSI/SNR can sit in half a dozen places depending on the network server.
//! Each known layout is one strategy; strategies run in a fixed order and
//! `rssi` and `snr` each take the first value any strategy yields.

use serde_json::Value;

use super::{field, number, path, payload_of};
use crate::models::SignalQuality;

// ---

pub type SignalExtractor = fn(&Value) -> SignalQuality;

/// Strategies in precedence order.
pub const SIGNAL_STRATEGIES: &[(&str, SignalExtractor)] = &[
    ("network_metadata_array", network_metadata_array),
    ("network_metadata_object", network_metadata_object),
    ("vendor_array", vendor_array),
    ("generic_metadata", generic_metadata),
    ("top_level", top_level),
    ("payload_embedded", payload_embedded),
];

const RSSI_KEYS: &[&str] = &["rssi", "channel_rssi"];
const SNR_KEYS: &[&str] = &["snr", "loRaSNR", "lora_snr"];

/// Resolve rssi and snr field by field across all strategies.
pub fn extract_signal(envelope: &Value) -> SignalQuality {
    // ---
    let mut found = SignalQuality::default();
    for (_, strategy) in SIGNAL_STRATEGIES {
        if found.rssi.is_some() && found.snr.is_some() {
            break;
        }
        let candidate = strategy(envelope);
        found.rssi = found.rssi.or(candidate.rssi);
        found.snr = found.snr.or(candidate.snr);
    }
    found
}

fn from_object(obj: &Value) -> SignalQuality {
    SignalQuality {
        rssi: field(obj, RSSI_KEYS).and_then(number),
        snr: field(obj, SNR_KEYS).and_then(number),
    }
}

/// First element carrying each field wins.
fn from_array(items: &[Value]) -> SignalQuality {
    SignalQuality {
        rssi: items.iter().find_map(|i| field(i, RSSI_KEYS).and_then(number)),
        snr: items.iter().find_map(|i| field(i, SNR_KEYS).and_then(number)),
    }
}

fn first_array<'a>(envelope: &'a Value, paths: &[&[&str]]) -> Option<&'a Vec<Value>> {
    paths
        .iter()
        .filter_map(|p| path(envelope, p))
        .find_map(Value::as_array)
}

fn network_metadata_array(envelope: &Value) -> SignalQuality {
    first_array(
        envelope,
        &[&["rxInfo"], &["uplink_message", "rx_metadata"], &["rx_metadata"]],
    )
    .map_or_else(SignalQuality::default, |items| from_array(items))
}

fn network_metadata_object(envelope: &Value) -> SignalQuality {
    [&["rxInfo"][..], &["rx_metadata"][..]]
        .iter()
        .filter_map(|p| path(envelope, p))
        .find(|v| v.is_object())
        .map_or_else(SignalQuality::default, from_object)
}

fn vendor_array(envelope: &Value) -> SignalQuality {
    first_array(envelope, &[&["hotspots"], &["gateways"]])
        .map_or_else(SignalQuality::default, |items| from_array(items))
}

fn generic_metadata(envelope: &Value) -> SignalQuality {
    envelope
        .get("metadata")
        .filter(|v| v.is_object())
        .map_or_else(SignalQuality::default, from_object)
}

fn top_level(envelope: &Value) -> SignalQuality {
    from_object(envelope)
}

fn payload_embedded(envelope: &Value) -> SignalQuality {
    let payload = payload_of(envelope);
    if std::ptr::eq(payload, envelope) {
        return SignalQuality::default();
    }
    from_object(payload)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategy_order_is_fixed() {
        // ---
        let names: Vec<&str> = SIGNAL_STRATEGIES.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "network_metadata_array",
                "network_metadata_object",
                "vendor_array",
                "generic_metadata",
                "top_level",
                "payload_embedded",
            ]
        );
    }

    #[test]
    fn test_network_metadata_array() {
        // ---
        let env = json!({ "rxInfo": [{ "gatewayId": "a" }, { "rssi": -101, "loRaSNR": 3.0 }] });
        let sq = network_metadata_array(&env);
        assert_eq!(sq.rssi, Some(-101.0));
        assert_eq!(sq.snr, Some(3.0));

        let env = json!({ "uplink_message": { "rx_metadata": [{ "channel_rssi": -90, "snr": 9 }] } });
        assert_eq!(network_metadata_array(&env).rssi, Some(-90.0));
    }

    #[test]
    fn test_network_metadata_object() {
        // ---
        let env = json!({ "rxInfo": { "rssi": -88, "snr": 1.5 } });
        assert_eq!(network_metadata_object(&env).rssi, Some(-88.0));
        assert_eq!(network_metadata_array(&env), SignalQuality::default());
    }

    #[test]
    fn test_vendor_array() {
        // ---
        let env = json!({ "hotspots": [{ "rssi": -115, "snr": -4.2 }] });
        let sq = vendor_array(&env);
        assert_eq!(sq.rssi, Some(-115.0));
        assert_eq!(sq.snr, Some(-4.2));
    }

    #[test]
    fn test_generic_metadata_and_top_level() {
        // ---
        let env = json!({ "metadata": { "rssi": "-70" }, "snr": 6 });
        assert_eq!(generic_metadata(&env).rssi, Some(-70.0));
        assert_eq!(top_level(&env).snr, Some(6.0));
    }

    #[test]
    fn test_payload_embedded() {
        // ---
        let env = json!({ "object": { "rssi": -60, "snr": 10 } });
        assert_eq!(payload_embedded(&env).rssi, Some(-60.0));

        // No separate payload object: nothing embedded
        let env = json!({ "rssi": -60 });
        assert_eq!(payload_embedded(&env), SignalQuality::default());
    }

    #[test]
    fn test_fields_resolve_independently() {
        // ---
        // rssi from the network array, snr only at top level
        let env = json!({ "rxInfo": [{ "rssi": -99 }], "snr": 4.0, "metadata": { "rssi": -10 } });
        let sq = extract_signal(&env);
        assert_eq!(sq.rssi, Some(-99.0));
        assert_eq!(sq.snr, Some(4.0));
    }

    #[test]
    fn test_nothing_found() {
        // ---
        assert_eq!(extract_signal(&json!({ "node_id": 1 })), SignalQuality::default());
    }
}
