//! JSON envelope used for datum travelling through the remote queue.
//!
//! ```json
//! {"kind": "node", "datum": {"node_id": 1, "source_id": "meter", "timestamp": "...", "samples": {...}}}
//! ```

use serde::ser::Error as _;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::types::Datum;
use crate::types::LocationDatum;
use crate::types::NodeDatum;
use crate::types::StreamDatum;

#[derive(Serialize)]
#[serde(tag = "kind", content = "datum", rename_all = "lowercase")]
enum EnvelopeRef<'a> {
    Stream(&'a StreamDatum),
    Node(&'a NodeDatum),
    Location(&'a LocationDatum),
}

#[derive(Deserialize)]
#[serde(tag = "kind", content = "datum", rename_all = "lowercase")]
enum Envelope {
    Stream(StreamDatum),
    Node(NodeDatum),
    Location(LocationDatum),
}

/// Encode a datum as a message body.
///
/// JSON can't carry NaN or infinite numbers; such a datum is refused rather than encoded into something
/// [`decode`] would reject.
pub fn encode(datum: &Datum) -> Result<String> {
    if !datum.samples().is_finite() {
        return Err(serde_json::Error::custom(format!("{} has non-finite samples", datum.key())).into());
    }
    let envelope = match datum {
        Datum::Stream(d) => EnvelopeRef::Stream(d),
        Datum::Node(d) => EnvelopeRef::Node(d),
        Datum::Location(d) => EnvelopeRef::Location(d),
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode(body: &str) -> Result<Datum> {
    Ok(match serde_json::from_str::<Envelope>(body)? {
        Envelope::Stream(d) => Datum::Stream(d),
        Envelope::Node(d) => Datum::Node(d),
        Envelope::Location(d) => Datum::Location(d),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatumSamples;
    use chrono::TimeZone;
    use chrono::Utc;

    #[test]
    fn envelope_carries_kind_tag() {
        let mut samples = DatumSamples::default();
        samples.instantaneous.insert("watts".into(), 231.5);
        let datum = Datum::Node(NodeDatum {
            node_id: 7,
            source_id: "meter/1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            samples,
        });

        let body = encode(&datum).unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["kind"], "node");
        assert_eq!(json["datum"]["node_id"], 7);
        assert_eq!(decode(&body).unwrap(), datum);
    }

    #[test]
    fn non_finite_samples_are_refused() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut samples = DatumSamples::default();
            samples.accumulating.insert("wattHours".into(), value);
            let datum = Datum::Stream(StreamDatum {
                stream_id: "s".into(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                samples,
            });
            assert!(matches!(encode(&datum), Err(crate::error::CollectorError::Codec(_))));
        }
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            decode("{\"kind\":\"planet\",\"datum\":{}}"),
            Err(crate::error::CollectorError::Codec(_))
        ));
        assert!(decode("not json").is_err());
    }
}
