//! Sensor data processors for ALIP data lines.
//!
//! Short device-side type names are rewritten into canonical sample types
//! (`T` -> `sen:temp`, `A3` -> `sen:adc:3`, ...) and location payloads are
//! parsed into JSON objects. Unknown types are stored as sent.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use m2mp_protocol::alip::{parse_device_time, AlipError};
use regex::Regex;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parsing {
    /// `lat,lon[,spd[,alt]]` or `sat`
    Location,
    /// `date,` followed by a location
    DatedLocation,
    AsIs,
}

const PROCESSORS: &[(&str, &str, Parsing)] = &[
    ("L", "sen:loc", Parsing::Location),
    ("G", "sen:loc", Parsing::DatedLocation),
    ("A([0-9]+)", "sen:adc:$1", Parsing::AsIs),
    ("DI([0-9]+)", "sen:gpio:$1", Parsing::AsIs),
    ("T", "sen:temp", Parsing::AsIs),
    ("V", "sen:volt", Parsing::AsIs),
    ("D", "sen:door", Parsing::AsIs),
    ("F", "sen:fuel", Parsing::AsIs),
    ("E", "sen:engine", Parsing::AsIs),
    ("SMS", "sen:sms_received", Parsing::AsIs),
    ("VER", "sen:version", Parsing::AsIs),
    ("LS:(.*)", "lsen:$1", Parsing::AsIs),
];

lazy_static! {
    static ref COMPILED: Vec<(Regex, &'static str, Parsing)> = PROCESSORS
        .iter()
        .map(|(pattern, replace, parsing)| {
            let regex = Regex::new(&format!("^{}$", pattern)).expect("static sensor pattern");
            (regex, *replace, *parsing)
        })
        .collect();
}

/// A data line ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub data_type: String,
    pub data: Value,
    /// Time carried inside the payload, overriding the line time.
    pub time: Option<DateTime<Utc>>,
}

/// Rewrites the type and parses the content of a data line.
pub fn process(data_type: &str, content: &str) -> Result<SensorSample, AlipError> {
    for (regex, replace, parsing) in COMPILED.iter() {
        if !regex.is_match(data_type) {
            continue;
        }
        let data_type = regex.replace(data_type, *replace).into_owned();
        let (data, time) = match parsing {
            Parsing::Location => (parse_location(content)?, None),
            Parsing::DatedLocation => {
                let (date, rest) = content
                    .split_once(',')
                    .ok_or(AlipError::Usage("Location: Not enough tokens"))?;
                let time = parse_device_time(date)?;
                (parse_location(rest)?, Some(time))
            }
            Parsing::AsIs => (Value::String(content.to_string()), None),
        };
        return Ok(SensorSample {
            data_type,
            data,
            time,
        });
    }

    Ok(SensorSample {
        data_type: data_type.to_string(),
        data: Value::String(content.to_string()),
        time: None,
    })
}

fn parse_location(content: &str) -> Result<Value, AlipError> {
    let tokens: Vec<&str> = content.split(',').collect();
    if tokens.len() == 1 {
        let sat: i64 = tokens[0].trim().parse().map_err(|_| AlipError::InvalidNumber {
            what: "number of satellites",
            value: tokens[0].to_string(),
        })?;
        return Ok(json!({ "sat": sat }));
    }

    let mut data = Map::new();
    for (name, what, token) in [
        ("lat", "latitude", tokens.first()),
        ("lon", "longitude", tokens.get(1)),
        ("spd", "speed", tokens.get(2)),
        ("alt", "altitude", tokens.get(3)),
    ] {
        let Some(token) = token else { break };
        let value: f64 = token.trim().parse().map_err(|_| AlipError::InvalidNumber {
            what,
            value: token.to_string(),
        })?;
        data.insert(name.to_string(), json!(value));
    }
    Ok(Value::Object(data))
}
