//! NSKeyedArchiver subset codec.
//!
//! The Instruments protocol carries selectors and arguments as keyed
//! archives: binary plists whose `$objects` table holds one slot per
//! distinct object, cross-referenced by UID. This module encodes and
//! decodes the class set the remote server uses: dictionaries, arrays,
//! data, dates and NSError.
//!
//! Interning is by identity. Strings, integers, booleans and reals are
//! deduplicated by value; every container occupies its own slot so that
//! equal-but-distinct collections never merge. Decoding follows UID
//! indirection and rejects cycles.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use plist::{Dictionary, Uid, Value};

use crate::Error;

const ARCHIVER: &str = "NSKeyedArchiver";
const ARCHIVER_VERSION: u64 = 100_000;
const NULL_SENTINEL: &str = "$null";

/// Seconds between the unix epoch and 2001-01-01 00:00:00 UTC, the NSDate
/// reference date.
const MAC_EPOCH_OFFSET: f64 = 978_307_200.0;

/// Encodes a plist value into a keyed archive (binary plist bytes).
pub fn encode_to_bytes(value: &Value) -> Result<Vec<u8>, Error> {
    let mut archiver = Archiver::new();
    let root = archiver.encode_value(value)?;

    let mut top = Dictionary::new();
    top.insert("root".into(), Value::Uid(Uid::new(root)));

    let mut envelope = Dictionary::new();
    envelope.insert("$archiver".into(), ARCHIVER.into());
    envelope.insert("$objects".into(), Value::Array(archiver.objects));
    envelope.insert("$top".into(), Value::Dictionary(top));
    envelope.insert("$version".into(), ARCHIVER_VERSION.into());

    let mut buf = Vec::new();
    Value::Dictionary(envelope).to_writer_binary(&mut buf)?;
    Ok(buf)
}

/// Decodes a keyed archive into a plain plist value.
///
/// NSError instances come back as dictionaries holding `NSCode`, `NSDomain`
/// and `NSUserInfo`; callers that care turn those into typed errors.
pub fn decode_from_bytes(bytes: &[u8]) -> Result<Value, Error> {
    // The native reader keeps UID values intact.
    let envelope = Value::from_reader(std::io::Cursor::new(bytes))?;
    let envelope = match envelope {
        Value::Dictionary(d) => d,
        _ => return Err(Error::UnexpectedResponse),
    };

    let objects = match envelope.get("$objects") {
        Some(Value::Array(objects)) => objects.clone(),
        _ => return Err(Error::UnexpectedResponse),
    };
    let root = match envelope.get("$top").and_then(|t| t.as_dictionary()) {
        Some(top) => match top.get("root") {
            Some(Value::Uid(uid)) => uid.get(),
            Some(Value::Integer(i)) => i.as_unsigned().ok_or(Error::UnexpectedResponse)?,
            _ => return Err(Error::UnexpectedResponse),
        },
        None => return Err(Error::UnexpectedResponse),
    };

    let decoder = Decoder { objects };
    let mut visiting = HashSet::new();
    decoder.resolve(root, &mut visiting)
}

#[derive(Hash, PartialEq, Eq)]
enum PrimKey {
    Bool(bool),
    UInt(u64),
    SInt(i64),
    Float(u64),
    Str(String),
}

struct Archiver {
    objects: Vec<Value>,
    primitives: HashMap<PrimKey, u64>,
    classes: HashMap<&'static str, u64>,
}

impl Archiver {
    fn new() -> Self {
        let mut archiver = Self {
            objects: Vec::new(),
            primitives: HashMap::new(),
            classes: HashMap::new(),
        };
        // Slot zero is always the null sentinel.
        archiver.intern(PrimKey::Str(NULL_SENTINEL.into()), NULL_SENTINEL.into());
        archiver
    }

    fn push(&mut self, value: Value) -> u64 {
        self.objects.push(value);
        (self.objects.len() - 1) as u64
    }

    fn intern(&mut self, key: PrimKey, value: Value) -> u64 {
        if let Some(uid) = self.primitives.get(&key) {
            return *uid;
        }
        let uid = self.push(value);
        self.primitives.insert(key, uid);
        uid
    }

    fn class_uid(&mut self, name: &'static str, chain: &[&str]) -> u64 {
        if let Some(uid) = self.classes.get(name) {
            return *uid;
        }
        let mut class = Dictionary::new();
        class.insert(
            "$classes".into(),
            Value::Array(chain.iter().map(|c| Value::from(*c)).collect()),
        );
        class.insert("$classname".into(), name.into());
        let uid = self.push(Value::Dictionary(class));
        self.classes.insert(name, uid);
        uid
    }

    fn encode_value(&mut self, value: &Value) -> Result<u64, Error> {
        match value {
            Value::String(s) => Ok(self.intern(PrimKey::Str(s.clone()), value.clone())),
            Value::Boolean(b) => Ok(self.intern(PrimKey::Bool(*b), value.clone())),
            Value::Integer(i) => {
                let key = match i.as_unsigned() {
                    Some(u) => PrimKey::UInt(u),
                    None => PrimKey::SInt(i.as_signed().ok_or(Error::UnexpectedResponse)?),
                };
                Ok(self.intern(key, value.clone()))
            }
            Value::Real(f) => Ok(self.intern(PrimKey::Float(f.to_bits()), value.clone())),
            Value::Data(data) => {
                let class = self.class_uid("NSData", &["NSData", "NSObject"]);
                let mut object = Dictionary::new();
                object.insert("$class".into(), Value::Uid(Uid::new(class)));
                object.insert("NS.data".into(), Value::Data(data.clone()));
                Ok(self.push(Value::Dictionary(object)))
            }
            Value::Date(date) => {
                let class = self.class_uid("NSDate", &["NSDate", "NSObject"]);
                let time: DateTime<Utc> = std::time::SystemTime::from(*date).into();
                let seconds = time.timestamp() as f64
                    + f64::from(time.timestamp_subsec_nanos()) / 1_000_000_000.0
                    - MAC_EPOCH_OFFSET;
                let mut object = Dictionary::new();
                object.insert("$class".into(), Value::Uid(Uid::new(class)));
                object.insert("NS.time".into(), Value::Real(seconds));
                Ok(self.push(Value::Dictionary(object)))
            }
            Value::Array(values) => {
                let class = self.class_uid("NSArray", &["NSArray", "NSObject"]);
                let mut uids = Vec::with_capacity(values.len());
                for v in values {
                    uids.push(Value::Uid(Uid::new(self.encode_value(v)?)));
                }
                let mut object = Dictionary::new();
                object.insert("$class".into(), Value::Uid(Uid::new(class)));
                object.insert("NS.objects".into(), Value::Array(uids));
                Ok(self.push(Value::Dictionary(object)))
            }
            Value::Dictionary(dict) => {
                let class = self.class_uid("NSDictionary", &["NSDictionary", "NSObject"]);
                let mut keys = Vec::with_capacity(dict.len());
                let mut values = Vec::with_capacity(dict.len());
                for (k, v) in dict {
                    keys.push(Value::Uid(Uid::new(
                        self.intern(PrimKey::Str(k.clone()), k.as_str().into()),
                    )));
                    values.push(Value::Uid(Uid::new(self.encode_value(v)?)));
                }
                let mut object = Dictionary::new();
                object.insert("$class".into(), Value::Uid(Uid::new(class)));
                object.insert("NS.keys".into(), Value::Array(keys));
                object.insert("NS.objects".into(), Value::Array(values));
                Ok(self.push(Value::Dictionary(object)))
            }
            other => {
                // UIDs and any future plist variants have no archive form.
                Err(Error::KeyedArchiveBadClass(format!("{other:?}")))
            }
        }
    }
}

struct Decoder {
    objects: Vec<Value>,
}

impl Decoder {
    fn resolve(&self, uid: u64, visiting: &mut HashSet<u64>) -> Result<Value, Error> {
        let object = self
            .objects
            .get(uid as usize)
            .ok_or(Error::KeyedArchiveBadUid(uid))?;
        if !visiting.insert(uid) {
            return Err(Error::KeyedArchiveBadUid(uid));
        }

        let result = match object {
            Value::Dictionary(dict) if dict.contains_key("$class") => {
                self.resolve_class_instance(dict, visiting)
            }
            Value::Dictionary(dict) => {
                // Not a class instance; resolve any UID entries in place.
                let mut out = Dictionary::new();
                for (k, v) in dict {
                    out.insert(k.clone(), self.resolve_entry(v, visiting)?);
                }
                Ok(Value::Dictionary(out))
            }
            Value::Uid(inner) => self.resolve(inner.get(), visiting),
            other => Ok(other.clone()),
        };

        visiting.remove(&uid);
        result
    }

    fn resolve_entry(&self, value: &Value, visiting: &mut HashSet<u64>) -> Result<Value, Error> {
        match value {
            Value::Uid(uid) => self.resolve(uid.get(), visiting),
            other => Ok(other.clone()),
        }
    }

    fn class_name(&self, dict: &Dictionary) -> Result<String, Error> {
        let uid = match dict.get("$class") {
            Some(Value::Uid(uid)) => uid.get(),
            _ => return Err(Error::UnexpectedResponse),
        };
        let class = self
            .objects
            .get(uid as usize)
            .ok_or(Error::KeyedArchiveBadUid(uid))?;
        class
            .as_dictionary()
            .and_then(|c| c.get("$classname"))
            .and_then(|n| n.as_string())
            .map(str::to_string)
            .ok_or(Error::UnexpectedResponse)
    }

    fn resolve_class_instance(
        &self,
        dict: &Dictionary,
        visiting: &mut HashSet<u64>,
    ) -> Result<Value, Error> {
        let name = self.class_name(dict)?;
        match name.as_str() {
            "NSMutableDictionary" | "NSDictionary" => {
                let keys = self.uid_list(dict, "NS.keys")?;
                let values = self.uid_list(dict, "NS.objects")?;
                if keys.len() != values.len() {
                    return Err(Error::UnexpectedResponse);
                }
                let mut out = Dictionary::new();
                for (k, v) in keys.iter().zip(values.iter()) {
                    let key = match self.resolve_entry(k, visiting)? {
                        Value::String(s) => s,
                        _ => return Err(Error::KeyedArchiveBadClass(name)),
                    };
                    out.insert(key, self.resolve_entry(v, visiting)?);
                }
                Ok(Value::Dictionary(out))
            }
            "NSMutableArray" | "NSArray" => {
                let values = self.uid_list(dict, "NS.objects")?;
                let mut out = Vec::with_capacity(values.len());
                for v in values {
                    out.push(self.resolve_entry(&v, visiting)?);
                }
                Ok(Value::Array(out))
            }
            "NSMutableData" | "NSData" => match self.resolve_field(dict, "NS.data", visiting)? {
                Value::Data(d) => Ok(Value::Data(d)),
                _ => Err(Error::UnexpectedResponse),
            },
            "NSDate" => {
                let seconds = match self.resolve_field(dict, "NS.time", visiting)? {
                    Value::Real(f) => f,
                    Value::Integer(i) => {
                        i.as_signed().ok_or(Error::UnexpectedResponse)? as f64
                    }
                    _ => return Err(Error::UnexpectedResponse),
                };
                let unix = seconds + MAC_EPOCH_OFFSET;
                let time = DateTime::<Utc>::from_timestamp(
                    unix.floor() as i64,
                    ((unix - unix.floor()) * 1_000_000_000.0).round() as u32,
                )
                .ok_or(Error::UnexpectedResponse)?;
                Ok(Value::Date(std::time::SystemTime::from(time).into()))
            }
            "NSError" => {
                let code = self.resolve_field(dict, "NSCode", visiting)?;
                let domain = self.resolve_field(dict, "NSDomain", visiting)?;
                let user_info = self.resolve_field(dict, "NSUserInfo", visiting)?;
                let mut out = Dictionary::new();
                out.insert("NSCode".into(), code);
                out.insert("NSDomain".into(), domain);
                out.insert("NSUserInfo".into(), user_info);
                Ok(Value::Dictionary(out))
            }
            _ => Err(Error::KeyedArchiveBadClass(name)),
        }
    }

    fn uid_list(&self, dict: &Dictionary, key: &str) -> Result<Vec<Value>, Error> {
        match dict.get(key) {
            Some(Value::Array(values)) => Ok(values.clone()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    fn resolve_field(
        &self,
        dict: &Dictionary,
        key: &str,
        visiting: &mut HashSet<u64>,
    ) -> Result<Value, Error> {
        let value = dict.get(key).ok_or(Error::UnexpectedResponse)?;
        self.resolve_entry(value, visiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> Value {
        let mut inner = Dictionary::new();
        inner.insert("name".into(), "backboardd".into());
        inner.insert("pid".into(), 64u64.into());
        inner.insert("isApplication".into(), false.into());

        let mut root = Dictionary::new();
        root.insert(
            "processes".into(),
            Value::Array(vec![
                Value::Dictionary(inner),
                Value::String("backboardd".into()),
            ]),
        );
        root.insert("blob".into(), Value::Data(vec![0xde, 0xad, 0xbe, 0xef]));
        root.insert("weight".into(), Value::Real(0.5));
        Value::Dictionary(root)
    }

    #[test]
    fn round_trip_preserves_the_graph() {
        let graph = sample_graph();
        let bytes = encode_to_bytes(&graph).unwrap();
        let decoded = decode_from_bytes(&bytes).unwrap();
        assert_eq!(decoded, graph);
    }

    #[test]
    fn canonical_reencode_is_stable() {
        let bytes = encode_to_bytes(&sample_graph()).unwrap();
        let reencoded = encode_to_bytes(&decode_from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(bytes, reencoded);
    }

    #[test]
    fn dates_survive_the_2001_epoch_shift() {
        let time = std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(1_600_000_000);
        let bytes = encode_to_bytes(&Value::Date(time.into())).unwrap();
        match decode_from_bytes(&bytes).unwrap() {
            Value::Date(d) => assert_eq!(std::time::SystemTime::from(d), time),
            other => panic!("expected a date, got {other:?}"),
        }
    }

    #[test]
    fn equal_collections_occupy_distinct_slots() {
        let a = Value::Array(vec![1u64.into()]);
        let b = Value::Array(vec![1u64.into()]);
        let bytes = encode_to_bytes(&Value::Array(vec![a, b])).unwrap();

        let envelope = Value::from_reader(std::io::Cursor::new(&bytes[..])).unwrap();
        let objects = envelope
            .as_dictionary()
            .and_then(|d| d.get("$objects"))
            .and_then(|o| o.as_array())
            .unwrap();
        // $null, the shared integer, the NSArray class, two inner arrays and
        // the outer array.
        let containers = objects
            .iter()
            .filter(|o| {
                o.as_dictionary()
                    .map(|d| d.contains_key("NS.objects"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(containers, 3);
    }

    #[test]
    fn hand_written_error_fixture_decodes() {
        // $objects: $null, instance, code, domain string, user info dict,
        // description string, NSError class, NSDictionary class.
        let mut instance = Dictionary::new();
        instance.insert("$class".into(), Value::Uid(Uid::new(6)));
        instance.insert("NSCode".into(), Value::Uid(Uid::new(2)));
        instance.insert("NSDomain".into(), Value::Uid(Uid::new(3)));
        instance.insert("NSUserInfo".into(), Value::Uid(Uid::new(4)));

        let mut user_info = Dictionary::new();
        user_info.insert("$class".into(), Value::Uid(Uid::new(7)));
        user_info.insert(
            "NS.keys".into(),
            Value::Array(vec![Value::Uid(Uid::new(5))]),
        );
        user_info.insert(
            "NS.objects".into(),
            Value::Array(vec![Value::Uid(Uid::new(5))]),
        );

        let mut error_class = Dictionary::new();
        error_class.insert(
            "$classes".into(),
            Value::Array(vec!["NSError".into(), "NSObject".into()]),
        );
        error_class.insert("$classname".into(), "NSError".into());

        let mut dict_class = Dictionary::new();
        dict_class.insert(
            "$classes".into(),
            Value::Array(vec!["NSDictionary".into(), "NSObject".into()]),
        );
        dict_class.insert("$classname".into(), "NSDictionary".into());

        let objects = vec![
            Value::String(NULL_SENTINEL.into()),
            Value::Dictionary(instance),
            Value::Integer(4u64.into()),
            Value::String("DTXMessage".into()),
            Value::Dictionary(user_info),
            Value::String("NSLocalizedDescription".into()),
            Value::Dictionary(error_class),
            Value::Dictionary(dict_class),
        ];

        let mut top = Dictionary::new();
        top.insert("root".into(), Value::Uid(Uid::new(1)));
        let mut envelope = Dictionary::new();
        envelope.insert("$archiver".into(), ARCHIVER.into());
        envelope.insert("$objects".into(), Value::Array(objects));
        envelope.insert("$top".into(), Value::Dictionary(top));
        envelope.insert("$version".into(), ARCHIVER_VERSION.into());
        let mut bytes = Vec::new();
        Value::Dictionary(envelope)
            .to_writer_binary(&mut bytes)
            .unwrap();

        let decoded = decode_from_bytes(&bytes).unwrap();
        let decoded = decoded.as_dictionary().unwrap();
        assert_eq!(
            decoded.get("NSCode").and_then(|v| v.as_unsigned_integer()),
            Some(4)
        );
        assert_eq!(
            decoded.get("NSDomain").and_then(|v| v.as_string()),
            Some("DTXMessage")
        );
        let user_info = decoded.get("NSUserInfo").unwrap().as_dictionary().unwrap();
        assert_eq!(
            user_info
                .get("NSLocalizedDescription")
                .and_then(|v| v.as_string()),
            Some("NSLocalizedDescription")
        );
    }

    #[test]
    fn uid_cycles_are_rejected() {
        let mut array_class = Dictionary::new();
        array_class.insert(
            "$classes".into(),
            Value::Array(vec!["NSArray".into(), "NSObject".into()]),
        );
        array_class.insert("$classname".into(), "NSArray".into());

        // The array at slot 1 contains itself.
        let mut cyclic = Dictionary::new();
        cyclic.insert("$class".into(), Value::Uid(Uid::new(2)));
        cyclic.insert(
            "NS.objects".into(),
            Value::Array(vec![Value::Uid(Uid::new(1))]),
        );

        let objects = vec![
            Value::String(NULL_SENTINEL.into()),
            Value::Dictionary(cyclic),
            Value::Dictionary(array_class),
        ];
        let mut top = Dictionary::new();
        top.insert("root".into(), Value::Uid(Uid::new(1)));
        let mut envelope = Dictionary::new();
        envelope.insert("$archiver".into(), ARCHIVER.into());
        envelope.insert("$objects".into(), Value::Array(objects));
        envelope.insert("$top".into(), Value::Dictionary(top));
        envelope.insert("$version".into(), ARCHIVER_VERSION.into());
        let mut bytes = Vec::new();
        Value::Dictionary(envelope)
            .to_writer_binary(&mut bytes)
            .unwrap();

        assert!(matches!(
            decode_from_bytes(&bytes),
            Err(Error::KeyedArchiveBadUid(1))
        ));
    }
}
