//! Record parsing.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset as _, Utc};
use snafu::Snafu;

use crate::record::{Coordinate, Record, TransmissionType, TransmissionTypeSet};

/// Number of fields in a BaseStation message.
pub const FIELD_COUNT: usize = squitter_io::framing::FIELD_COUNT;

/// Names of the positional fields, in wire order.
pub const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "message_type",
    "transmission_type",
    "session_id",
    "aircraft_id",
    "icao_address",
    "flight_id",
    "generated_date",
    "generated_time",
    "logged_date",
    "logged_time",
    "callsign",
    "altitude",
    "ground_speed",
    "track",
    "latitude",
    "longitude",
    "vertical_rate",
    "squawk",
    "alert",
    "emergency",
    "spi",
    "is_on_ground",
];

const DATE_FORMAT: &str = "%Y/%m/%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const MAX_ICAO_ADDRESS: u32 = 0xFF_FFFF;

// Feeds that anonymize identity fields fill them with one of these triples instead of leaving them empty.
const PLACEHOLDER_IDENTITIES: [[&str; 3]; 2] = [["111", "11111", "111111"], ["1", "1", "1"]];

/// Record parse error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseError {
    /// The line did not split into the expected number of fields.
    #[snafu(display("expected {} fields, found {}", expected, actual))]
    FieldCount {
        /// Expected number of fields.
        expected: usize,

        /// Actual number of fields.
        actual: usize,
    },

    /// The line was not valid UTF-8.
    #[snafu(display("line is not valid UTF-8"))]
    InvalidUtf8,

    /// The transmission type is valid but not in the accepted set.
    #[snafu(display("transmission type {} is not accepted", transmission_type))]
    NotAccepted {
        /// The rejected transmission type.
        transmission_type: TransmissionType,
    },

    /// A field held a value that could not be coerced to its type.
    #[snafu(display("invalid value '{}' for field '{}': {}", value, field, reason))]
    InvalidField {
        /// Name of the field.
        field: &'static str,

        /// Raw value of the field.
        value: String,

        /// Why the value was rejected.
        reason: &'static str,
    },

    /// A required field was empty.
    #[snafu(display("required field '{}' is empty", field))]
    MissingField {
        /// Name of the field.
        field: &'static str,
    },
}

impl ParseError {
    /// Returns the reason for the rejection.
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::FieldCount { .. } => RejectReason::FieldCount,
            Self::InvalidUtf8 => RejectReason::InvalidUtf8,
            Self::NotAccepted { .. } => RejectReason::NotAccepted,
            Self::InvalidField { .. } => RejectReason::InvalidField,
            Self::MissingField { .. } => RejectReason::MissingField,
        }
    }
}

/// Coarse reason a line was rejected by the parser.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RejectReason {
    /// Wrong number of fields.
    FieldCount,

    /// Not valid UTF-8.
    InvalidUtf8,

    /// Transmission type not accepted.
    NotAccepted,

    /// A field failed coercion.
    InvalidField,

    /// A required field was empty.
    MissingField,
}

impl RejectReason {
    /// Returns the reason as a metric label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FieldCount => "field_count",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::NotAccepted => "not_accepted",
            Self::InvalidField => "invalid_field",
            Self::MissingField => "missing_field",
        }
    }
}

/// Parses BaseStation lines into [`Record`]s.
#[derive(Clone, Debug)]
pub struct RecordParser {
    source_id: u16,
    accepted: TransmissionTypeSet,
    is_mlat: bool,
    timezone: FixedOffset,
}

impl RecordParser {
    /// Creates a new `RecordParser` that tags records with the given source ID.
    ///
    /// Defaults to the default accepted set of transmission types, a non-multilateration source, and a receiver clock
    /// in UTC.
    pub fn new(source_id: u16) -> Self {
        Self {
            source_id,
            accepted: TransmissionTypeSet::default(),
            is_mlat: false,
            timezone: Utc.fix(),
        }
    }

    /// Sets the transmission types that are accepted.
    pub fn with_accepted(mut self, accepted: TransmissionTypeSet) -> Self {
        self.accepted = accepted;
        self
    }

    /// Sets whether records are marked as coming from a multilateration source.
    pub fn with_mlat(mut self, is_mlat: bool) -> Self {
        self.is_mlat = is_mlat;
        self
    }

    /// Sets the UTC offset of the receiver's clock.
    ///
    /// The generated and logged date/time fields carry no zone of their own, so they are read at this offset.
    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }

    /// Returns `true` if records are marked as coming from a multilateration source.
    pub fn is_mlat(&self) -> bool {
        self.is_mlat
    }

    /// Parses a single line into a record.
    ///
    /// Fields are trimmed of surrounding whitespace before coercion. The transmission type is checked first, so lines
    /// of an unwanted type are rejected without looking at the rest of the line.
    ///
    /// # Errors
    ///
    /// If the line does not hold exactly 22 fields, has a transmission type outside the accepted set, or holds any field
    /// that cannot be coerced to its type, an error is returned and no record is produced.
    pub fn parse(&self, line: &[u8], parsed_at: DateTime<Utc>) -> Result<Record, ParseError> {
        let text = simdutf8::basic::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;
        let fields = split_fields(text)?;

        let transmission_type = parse_transmission_type(fields[1])?;
        if !self.accepted.contains(transmission_type) {
            return Err(ParseError::NotAccepted { transmission_type });
        }

        let message_type = fields[0].trim_start_matches(|c: char| c.is_ascii_digit()).trim().to_string();

        let icao_address = parse_icao_address(fields[4])?;
        let generated_date = parse_optional_with(6, fields[6], |s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())?;
        let generated_time = parse_optional_with(7, fields[7], |s| NaiveTime::parse_from_str(s, TIME_FORMAT).ok())?;
        let logged_date = parse_optional_with(8, fields[8], |s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())?;
        let logged_time = parse_optional_with(9, fields[9], |s| NaiveTime::parse_from_str(s, TIME_FORMAT).ok())?;

        let (session_id, aircraft_id, flight_id) = if is_placeholder_identity(fields[2], fields[3], fields[5]) {
            (None, None, None)
        } else {
            (optional_string(fields[2]), optional_string(fields[3]), optional_string(fields[5]))
        };

        Ok(Record {
            message_type,
            transmission_type,
            session_id,
            aircraft_id,
            icao_address,
            flight_id,
            generated_date,
            generated_time,
            logged_date,
            logged_time,
            callsign: optional_string(fields[10]),
            altitude: parse_optional(11, fields[11])?,
            ground_speed: parse_optional(12, fields[12])?,
            track: parse_optional(13, fields[13])?,
            latitude: parse_optional_with(14, fields[14], |s| Coordinate::from_str(s).ok())?,
            longitude: parse_optional_with(15, fields[15], |s| Coordinate::from_str(s).ok())?,
            vertical_rate: parse_optional(16, fields[16])?,
            squawk: parse_optional_with(17, fields[17], parse_squawk)?,
            alert: parse_flag(fields[18]),
            emergency: parse_flag(fields[19]),
            spi: parse_flag(fields[20]),
            is_on_ground: parse_flag(fields[21]),
            parsed_at,
            generated_at: self.resolve(generated_date, generated_time),
            logged_at: self.resolve(logged_date, logged_time),
            is_mlat: self.is_mlat,
            source_id: self.source_id,
        })
    }
}

impl RecordParser {
    fn resolve(&self, date: Option<NaiveDate>, time: Option<NaiveTime>) -> Option<DateTime<Utc>> {
        let local = date.zip(time).map(|(d, t)| NaiveDateTime::new(d, t))?;
        local
            .and_local_timezone(self.timezone)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn split_fields(text: &str) -> Result<[&str; FIELD_COUNT], ParseError> {
    let mut fields = [""; FIELD_COUNT];
    let mut actual = 0;
    for field in text.split(',') {
        if let Some(slot) = fields.get_mut(actual) {
            *slot = field.trim();
        }
        actual += 1;
    }

    if actual != FIELD_COUNT {
        return Err(ParseError::FieldCount {
            expected: FIELD_COUNT,
            actual,
        });
    }

    Ok(fields)
}

fn invalid(index: usize, value: &str, reason: &'static str) -> ParseError {
    ParseError::InvalidField {
        field: FIELD_NAMES[index],
        value: value.to_string(),
        reason,
    }
}

fn parse_transmission_type(value: &str) -> Result<TransmissionType, ParseError> {
    if value.is_empty() {
        return Err(ParseError::MissingField {
            field: FIELD_NAMES[1],
        });
    }

    value
        .parse::<u8>()
        .ok()
        .and_then(|n| TransmissionType::try_from(n).ok())
        .ok_or_else(|| invalid(1, value, "not a transmission type between 1 and 8"))
}

fn parse_icao_address(value: &str) -> Result<u32, ParseError> {
    if value.is_empty() {
        return Err(ParseError::MissingField {
            field: FIELD_NAMES[4],
        });
    }

    if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid(4, value, "not a hexadecimal number"));
    }

    match u32::from_str_radix(value, 16) {
        Ok(address) if address <= MAX_ICAO_ADDRESS => Ok(address),
        _ => Err(invalid(4, value, "exceeds 24 bits")),
    }
}

fn parse_squawk(value: &str) -> Option<u16> {
    if value.len() > 4 || !value.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return None;
    }
    u16::from_str_radix(value, 8).ok()
}

fn optional_string(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_optional<T: FromStr>(index: usize, value: &str) -> Result<Option<T>, ParseError> {
    parse_optional_with(index, value, |s| s.parse().ok())
}

fn parse_optional_with<T, F>(index: usize, value: &str, parse: F) -> Result<Option<T>, ParseError>
where
    F: FnOnce(&str) -> Option<T>,
{
    if value.is_empty() {
        return Ok(None);
    }

    parse(value)
        .map(Some)
        .ok_or_else(|| invalid(index, value, "could not be coerced"))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "" => None,
        "0" => Some(false),
        _ => Some(true),
    }
}

fn is_placeholder_identity(session_id: &str, aircraft_id: &str, flight_id: &str) -> bool {
    PLACEHOLDER_IDENTITIES
        .iter()
        .any(|[s, a, f]| *s == session_id && *a == aircraft_id && *f == flight_id)
}
