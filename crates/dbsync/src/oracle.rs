//! Oracle datum decoding.
//!
//! The oracle UTXO carries an inline datum in db-sync's detailed-schema JSON:
//! a map from currency code bytes to a rate, either a plain integer or a
//! `[numerator, denominator]` list. The map may be wrapped in a constructor.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use marketsync_core::error::{ChainError, ChainResult};

/// Decode every `currency -> rate` entry of an oracle datum.
pub fn parse_oracle_rates(datum: &Value) -> ChainResult<HashMap<String, Decimal>> {
    let entries = rate_map(datum)?;

    let mut rates = HashMap::with_capacity(entries.len());
    for entry in entries {
        let key = entry
            .get("k")
            .ok_or_else(|| decoding("map entry without key"))?;
        let value = entry
            .get("v")
            .ok_or_else(|| decoding("map entry without value"))?;
        rates.insert(currency_code(key)?, rate_value(value)?);
    }
    Ok(rates)
}

fn rate_map(datum: &Value) -> ChainResult<&Vec<Value>> {
    if let Some(entries) = datum.get("map").and_then(Value::as_array) {
        return Ok(entries);
    }
    // Constr 0 [map]
    if let Some(inner) = datum
        .get("fields")
        .and_then(Value::as_array)
        .and_then(|fields| fields.first())
    {
        return rate_map(inner);
    }
    Err(decoding("oracle datum is not a map"))
}

fn currency_code(key: &Value) -> ChainResult<String> {
    let hex_bytes = key
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| decoding("currency key is not bytes"))?;
    let bytes = hex::decode(hex_bytes).map_err(|e| decoding(&format!("currency key: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| decoding(&format!("currency key: {}", e)))
}

fn rate_value(value: &Value) -> ChainResult<Decimal> {
    if let Some(int) = value.get("int") {
        return integer(int);
    }
    if let Some(list) = value.get("list").and_then(Value::as_array) {
        let [num, den] = list.as_slice() else {
            return Err(decoding("rate list must hold numerator and denominator"));
        };
        let num = integer(num.get("int").unwrap_or(num))?;
        let den = integer(den.get("int").unwrap_or(den))?;
        return num
            .checked_div(den)
            .ok_or_else(|| decoding("rate denominator is zero"));
    }
    Err(decoding("rate is neither an integer nor a fraction"))
}

fn integer(value: &Value) -> ChainResult<Decimal> {
    match value {
        Value::Number(n) => {
            Decimal::from_str(&n.to_string()).map_err(|e| decoding(&format!("rate: {}", e)))
        }
        _ => Err(decoding("rate is not an integer")),
    }
}

fn decoding(msg: &str) -> ChainError {
    ChainError::DecodingError(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(code: &str) -> Value {
        json!({ "bytes": hex::encode(code) })
    }

    #[test]
    fn test_parses_integer_and_fraction_rates() {
        let datum = json!({
            "map": [
                { "k": key("USD"), "v": { "int": 500000 } },
                { "k": key("EUR"), "v": { "list": [{ "int": 1 }, { "int": 4 }] } }
            ]
        });

        let rates = parse_oracle_rates(&datum).unwrap();
        assert_eq!(rates["USD"], Decimal::new(500000, 0));
        assert_eq!(rates["EUR"], Decimal::new(25, 2));
    }

    #[test]
    fn test_unwraps_constructor() {
        let datum = json!({
            "constructor": 0,
            "fields": [{ "map": [{ "k": key("USD"), "v": { "int": 2 } }] }]
        });

        let rates = parse_oracle_rates(&datum).unwrap();
        assert_eq!(rates.get("USD"), Some(&Decimal::new(2, 0)));
        assert!(!rates.contains_key("EUR"));
    }

    // Test critique: un dénominateur nul est rejeté, jamais une division
    #[test]
    fn test_zero_denominator_is_rejected() {
        let datum = json!({
            "map": [{ "k": key("USD"), "v": { "list": [{ "int": 1 }, { "int": 0 }] } }]
        });
        let err = parse_oracle_rates(&datum).unwrap_err();
        assert!(matches!(err, ChainError::DecodingError(_)));
    }

    #[test]
    fn test_rejects_non_map_datum() {
        assert!(parse_oracle_rates(&json!({ "int": 3 })).is_err());
        assert!(parse_oracle_rates(&json!({ "map": [{ "k": { "int": 1 }, "v": { "int": 1 } }] })).is_err());
    }
}
