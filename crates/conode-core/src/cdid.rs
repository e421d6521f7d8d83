//! Content identifiers (CDIDs) and time chunking.
//!
//! A CDID is 16 bytes: 10 data bytes followed by the creation time as 6 bytes
//! of big-endian milliseconds since the Unix epoch. The string form is the
//! lowercase Crockford base32 alphabet without padding (26 chars).

use std::fmt;
use std::str::FromStr;

use base32::Alphabet;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::keccak256;
use crate::error::CoreError;

/// Length of a CDID in bytes.
pub const CDID_LEN: usize = 16;

/// Length of the string form.
pub const CDID_STR_LEN: usize = 26;

/// Width of a timeline chunk window in seconds.
pub const CHUNK_SECONDS: i64 = 600;

const DATA_LEN: usize = 10;
const ALPHABET: &str = "0123456789abcdefghjkmnpqrstvwxyz";

/// A 16-byte content identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cdid([u8; CDID_LEN]);

impl Cdid {
    /// Build from explicit data bytes and a time.
    pub fn new(data: [u8; DATA_LEN], time: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; CDID_LEN];
        bytes[..DATA_LEN].copy_from_slice(&data);
        let millis = time.timestamp_millis().max(0) as u64;
        bytes[DATA_LEN..].copy_from_slice(&millis.to_be_bytes()[2..]);
        Self(bytes)
    }

    /// Mint a fresh CDID with random data bytes at the current time.
    pub fn make() -> Self {
        Self::make_at(Utc::now())
    }

    /// Mint a CDID with random data bytes at the given time.
    pub fn make_at(time: DateTime<Utc>) -> Self {
        let mut data = [0u8; DATA_LEN];
        rand::thread_rng().fill_bytes(&mut data);
        Self::new(data, time)
    }

    /// Derive a CDID from document content: the data bytes are the first ten
    /// bytes of `keccak256(content)`.
    pub fn from_content(content: &[u8], time: DateTime<Utc>) -> Self {
        let hash = keccak256(content);
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&hash[..DATA_LEN]);
        Self::new(data, time)
    }

    pub const fn from_bytes(bytes: [u8; CDID_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> &[u8; CDID_LEN] {
        &self.0
    }

    /// Parse the 26-char string form.
    ///
    /// Only the lowercase alphabet is accepted; `i`, `l`, `o` and `u` never
    /// appear in a valid CDID.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.len() != CDID_STR_LEN {
            return Err(CoreError::InvalidId(format!(
                "cdid must be {} chars, got {}",
                CDID_STR_LEN,
                s.len()
            )));
        }
        if let Some(c) = s.chars().find(|c| !ALPHABET.contains(*c)) {
            return Err(CoreError::InvalidId(format!("invalid cdid character `{}`", c)));
        }

        let decoded = base32::decode(Alphabet::Crockford, &s.to_ascii_uppercase())
            .ok_or_else(|| CoreError::InvalidId(format!("invalid cdid `{}`", s)))?;
        let bytes: [u8; CDID_LEN] = decoded
            .get(..CDID_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CoreError::InvalidId(format!("invalid cdid `{}`", s)))?;
        Ok(Self(bytes))
    }

    /// The time encoded in the trailing six bytes.
    pub fn time(&self) -> DateTime<Utc> {
        let mut buf = [0u8; 8];
        buf[2..].copy_from_slice(&self.0[DATA_LEN..]);
        let millis = u64::from_be_bytes(buf) as i64;
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
    }

    pub fn to_base32(&self) -> String {
        base32::encode(Alphabet::Crockford, &self.0).to_ascii_lowercase()
    }
}

impl fmt::Display for Cdid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cdid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cdid({})", self.to_base32())
    }
}

impl FromStr for Cdid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Cdid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for Cdid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Kinds of CDID-addressed resources, each with a one-letter prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Message,
    Association,
    Profile,
    Timeline,
    Subscription,
}

impl ResourceKind {
    pub const fn prefix(self) -> char {
        match self {
            Self::Message => 'm',
            Self::Association => 'a',
            Self::Profile => 'p',
            Self::Timeline => 't',
            Self::Subscription => 's',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'm' => Some(Self::Message),
            'a' => Some(Self::Association),
            'p' => Some(Self::Profile),
            't' => Some(Self::Timeline),
            's' => Some(Self::Subscription),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Association => "association",
            Self::Profile => "profile",
            Self::Timeline => "timeline",
            Self::Subscription => "subscription",
        }
    }
}

/// A CDID tagged with its resource kind; the string form is 27 chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypedId {
    kind: ResourceKind,
    cdid: Cdid,
}

impl TypedId {
    pub const fn new(kind: ResourceKind, cdid: Cdid) -> Self {
        Self { kind, cdid }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let mut chars = s.chars();
        let prefix = chars
            .next()
            .ok_or_else(|| CoreError::InvalidId("empty id".into()))?;
        let kind = ResourceKind::from_prefix(prefix)
            .ok_or_else(|| CoreError::InvalidId(format!("unknown id prefix `{}`", prefix)))?;
        let cdid = Cdid::parse(chars.as_str())?;
        Ok(Self { kind, cdid })
    }

    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub const fn cdid(&self) -> &Cdid {
        &self.cdid
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.cdid.time()
    }
}

impl fmt::Display for TypedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.cdid)
    }
}

impl fmt::Debug for TypedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedId({})", self)
    }
}

impl FromStr for TypedId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TypedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypedId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Chunk key for a time: `floor(unix(t) / 600) * 600` as a decimal string.
pub fn chunk_key(time: DateTime<Utc>) -> String {
    (time.timestamp().div_euclid(CHUNK_SECONDS) * CHUNK_SECONDS).to_string()
}

/// The half-open window `[start, end)` covered by a chunk key.
pub fn chunk_bounds(key: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), CoreError> {
    let start: i64 = key
        .parse()
        .map_err(|_| CoreError::InvalidId(format!("invalid chunk key `{}`", key)))?;
    if start.rem_euclid(CHUNK_SECONDS) != 0 {
        return Err(CoreError::InvalidId(format!("unaligned chunk key `{}`", key)));
    }
    let from = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| CoreError::InvalidId(format!("chunk key out of range `{}`", key)))
    };
    Ok((from(start)?, from(start + CHUNK_SECONDS)?))
}
