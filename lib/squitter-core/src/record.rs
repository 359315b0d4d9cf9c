//! Record model.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Serialize, Serializer};
use snafu::Snafu;

/// BaseStation transmission type.
///
/// The transmission type determines which of the remaining fields in a message are meaningful.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum TransmissionType {
    /// ES identification and category (callsign).
    IdentificationAndCategory = 1,

    /// ES surface position.
    SurfacePosition = 2,

    /// ES airborne position.
    AirbornePosition = 3,

    /// ES airborne velocity.
    AirborneVelocity = 4,

    /// Surveillance altitude.
    SurveillanceAltitude = 5,

    /// Surveillance ID (squawk).
    SurveillanceId = 6,

    /// Air-to-air message.
    AirToAir = 7,

    /// All call reply.
    AllCallReply = 8,
}

impl TransmissionType {
    /// All transmission types, in numeric order.
    pub const ALL: [TransmissionType; 8] = [
        Self::IdentificationAndCategory,
        Self::SurfacePosition,
        Self::AirbornePosition,
        Self::AirborneVelocity,
        Self::SurveillanceAltitude,
        Self::SurveillanceId,
        Self::AirToAir,
        Self::AllCallReply,
    ];

    /// Returns the numeric value of the transmission type.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the class this transmission type is throttled as.
    ///
    /// Airborne positions and all call replies are throttled together with surface positions, and air-to-air messages
    /// together with surveillance altitude. Every other type is its own class.
    pub const fn throttle_alias(self) -> TransmissionType {
        match self {
            Self::AirbornePosition | Self::AllCallReply => Self::SurfacePosition,
            Self::AirToAir => Self::SurveillanceAltitude,
            other => other,
        }
    }

    /// Returns `true` if this type is its own throttle class.
    pub const fn is_canonical(self) -> bool {
        self.throttle_alias() as u8 == self as u8
    }
}

impl TryFrom<u8> for TransmissionType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(value).wrapping_sub(1)).copied().ok_or(value)
    }
}

impl fmt::Display for TransmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl Serialize for TransmissionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// A set of transmission types.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct TransmissionTypeSet {
    bits: u16,
}

impl TransmissionTypeSet {
    /// Creates an empty set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Creates a set containing every transmission type.
    pub const fn all() -> Self {
        Self { bits: 0b1_1111_1110 }
    }

    /// Adds a transmission type to the set.
    pub fn insert(&mut self, tt: TransmissionType) {
        self.bits |= 1 << tt.as_u8();
    }

    /// Returns `true` if the set contains the given transmission type.
    pub fn contains(&self, tt: TransmissionType) -> bool {
        self.bits & (1 << tt.as_u8()) != 0
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns an iterator over the transmission types in the set, in numeric order.
    pub fn iter(&self) -> impl Iterator<Item = TransmissionType> + '_ {
        TransmissionType::ALL.into_iter().filter(|tt| self.contains(*tt))
    }
}

impl Default for TransmissionTypeSet {
    /// Every transmission type except all call replies, which are frequent but carry nothing useful.
    fn default() -> Self {
        let mut set = Self::all();
        set.bits &= !(1 << TransmissionType::AllCallReply.as_u8());
        set
    }
}

impl FromIterator<TransmissionType> for TransmissionTypeSet {
    fn from_iter<I: IntoIterator<Item = TransmissionType>>(iter: I) -> Self {
        let mut set = Self::empty();
        for tt in iter {
            set.insert(tt);
        }
        set
    }
}

impl fmt::Debug for TransmissionTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(TransmissionType::as_u8)).finish()
    }
}

/// Coordinate parse error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CoordinateError {
    /// The value is not a plain decimal number.
    #[snafu(display("not a decimal number"))]
    Malformed,

    /// The value does not fit in the fixed-point representation.
    #[snafu(display("decimal value out of range"))]
    OutOfRange,
}

/// A decimal coordinate with five fractional digits, stored as fixed-point.
///
/// Five fractional digits of a degree is roughly one metre of precision, which is more than any BaseStation feed carries.
/// Inputs with more fractional digits are rounded half away from zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Coordinate(i64);

impl Coordinate {
    /// Number of fractional digits retained.
    pub const SCALE_DIGITS: u32 = 5;

    const SCALE: i64 = 10_i64.pow(Self::SCALE_DIGITS);

    /// Creates a coordinate from its scaled integer representation.
    pub const fn from_scaled(scaled: i64) -> Self {
        Self(scaled)
    }

    /// Returns the scaled integer representation, in units of 10^-5.
    pub const fn scaled(self) -> i64 {
        self.0
    }

    /// Returns the coordinate as a floating-point value.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl FromStr for Coordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, unsigned) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (unsigned, ""),
        };

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
            return Err(CoordinateError::Malformed);
        }

        let mut magnitude: i64 = 0;
        for digit in int_part.bytes() {
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add(i64::from(digit - b'0')))
                .ok_or(CoordinateError::OutOfRange)?;
        }

        let mut fraction: i64 = 0;
        let mut frac_digits = frac_part.bytes();
        for _ in 0..Self::SCALE_DIGITS {
            let digit = frac_digits.next().map_or(0, |b| i64::from(b - b'0'));
            fraction = fraction * 10 + digit;
        }
        if frac_digits.next().is_some_and(|b| b >= b'5') {
            fraction += 1;
        }

        let scaled = magnitude
            .checked_mul(Self::SCALE)
            .and_then(|m| m.checked_add(fraction))
            .ok_or(CoordinateError::OutOfRange)?;

        Ok(Self(if negative { -scaled } else { scaled }))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.0.unsigned_abs();
        let scale = Self::SCALE.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            magnitude / scale,
            magnitude % scale,
            width = Self::SCALE_DIGITS as usize
        )
    }
}

impl Serialize for Coordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

/// A typed BaseStation message.
///
/// Fields mirror the 22 positional fields of the wire format, followed by values derived at parse time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    /// Message type, such as `MSG`, `SEL`, or `AIR`.
    pub message_type: String,

    /// Transmission type.
    pub transmission_type: TransmissionType,

    /// Session ID, if not a placeholder.
    pub session_id: Option<String>,

    /// Aircraft ID, if not a placeholder.
    pub aircraft_id: Option<String>,

    /// 24-bit ICAO aircraft address.
    pub icao_address: u32,

    /// Flight ID, if not a placeholder.
    pub flight_id: Option<String>,

    /// Date the message was generated.
    pub generated_date: Option<NaiveDate>,

    /// Time the message was generated.
    pub generated_time: Option<NaiveTime>,

    /// Date the message was logged.
    pub logged_date: Option<NaiveDate>,

    /// Time the message was logged.
    pub logged_time: Option<NaiveTime>,

    /// Callsign.
    pub callsign: Option<String>,

    /// Altitude, in feet.
    pub altitude: Option<i32>,

    /// Ground speed, in knots.
    pub ground_speed: Option<i32>,

    /// Track, in degrees.
    pub track: Option<i32>,

    /// Latitude, in degrees.
    pub latitude: Option<Coordinate>,

    /// Longitude, in degrees.
    pub longitude: Option<Coordinate>,

    /// Vertical rate, in feet per minute.
    pub vertical_rate: Option<i32>,

    /// Squawk code, as the integer value of its octal representation.
    pub squawk: Option<u16>,

    /// Squawk change flag.
    pub alert: Option<bool>,

    /// Emergency flag.
    pub emergency: Option<bool>,

    /// Special position identification flag.
    pub spi: Option<bool>,

    /// Whether the aircraft is on the ground.
    pub is_on_ground: Option<bool>,

    /// When the message was parsed.
    pub parsed_at: DateTime<Utc>,

    /// When the message was generated, if both halves were present.
    ///
    /// The halves are read in the time zone of the receiver's clock.
    pub generated_at: Option<DateTime<Utc>>,

    /// When the message was logged, if both halves were present.
    ///
    /// The halves are read in the time zone of the receiver's clock.
    pub logged_at: Option<DateTime<Utc>>,

    /// Whether the message came from a multilateration source.
    pub is_mlat: bool,

    /// Tag of the feed the message came from.
    pub source_id: u16,
}

impl Record {
    /// Returns `true` if the record carries both latitude and longitude.
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn transmission_type_conversion() {
        for value in 1..=8u8 {
            let tt = TransmissionType::try_from(value).unwrap();
            assert_eq!(tt.as_u8(), value);
        }

        assert_eq!(TransmissionType::try_from(0), Err(0));
        assert_eq!(TransmissionType::try_from(9), Err(9));
        assert_eq!(TransmissionType::try_from(255), Err(255));
    }

    #[test]
    fn throttle_aliases() {
        use TransmissionType::*;

        assert_eq!(AirbornePosition.throttle_alias(), SurfacePosition);
        assert_eq!(AllCallReply.throttle_alias(), SurfacePosition);
        assert_eq!(AirToAir.throttle_alias(), SurveillanceAltitude);

        for tt in [IdentificationAndCategory, SurfacePosition, AirborneVelocity, SurveillanceAltitude, SurveillanceId] {
            assert_eq!(tt.throttle_alias(), tt);
            assert!(tt.is_canonical());
        }

        assert!(!AirbornePosition.is_canonical());
    }

    #[test]
    fn default_accept_set_excludes_all_call_reply() {
        let set = TransmissionTypeSet::default();
        assert_eq!(set.iter().map(TransmissionType::as_u8).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(!set.contains(TransmissionType::AllCallReply));
        assert!(TransmissionTypeSet::all().contains(TransmissionType::AllCallReply));
        assert!(TransmissionTypeSet::empty().is_empty());
    }

    #[test]
    fn coordinate_parsing() {
        let cases = [
            ("51.47123", 5_147_123),
            ("-0.45123", -45_123),
            ("+12.5", 1_250_000),
            ("0", 0),
            (".5", 50_000),
            ("7.", 700_000),
            ("1.000004", 100_000),
            ("1.000005", 100_001),
            ("-1.000005", -100_001),
            ("179.999999", 18_000_000),
        ];

        for (input, expected) in cases {
            assert_eq!(input.parse::<Coordinate>().unwrap().scaled(), expected, "input: {}", input);
        }

        for input in ["", "-", ".", "1.2.3", "1e5", "abc", " 1.0", "--1"] {
            assert_eq!(input.parse::<Coordinate>(), Err(CoordinateError::Malformed), "input: {:?}", input);
        }

        assert_eq!(
            "99999999999999999999".parse::<Coordinate>(),
            Err(CoordinateError::OutOfRange)
        );
    }

    #[test]
    fn coordinate_display() {
        assert_eq!(Coordinate::from_scaled(5_147_123).to_string(), "51.47123");
        assert_eq!(Coordinate::from_scaled(-45_123).to_string(), "-0.45123");
        assert_eq!(Coordinate::from_scaled(1_250_000).to_string(), "12.50000");
        assert_eq!(Coordinate::from_scaled(0).to_string(), "0.00000");
    }

    #[test]
    fn coordinate_serializes_as_number() {
        let lat = "51.47123".parse::<Coordinate>().unwrap();
        assert_eq!(serde_json::to_string(&lat).unwrap(), "51.47123");
    }

    proptest! {
        #[test]
        fn property_test_coordinate_display_parses_back(scaled in -18_000_000i64..=18_000_000i64) {
            let coordinate = Coordinate::from_scaled(scaled);
            prop_assert_eq!(coordinate.to_string().parse::<Coordinate>().unwrap(), coordinate);
        }
    }
}
