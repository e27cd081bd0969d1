//! Personal task and log ledger.
//! Modules keep the domain pure (codec, clock, filter, store, schedule, ledger) and push
//! rendering, persistence and configuration to the edges so the binary stays a thin dispatcher.

pub mod core {
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Session handle for a record. Assigned on creation or load, never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RecordId(pub Uuid);

    impl RecordId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for RecordId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for RecordId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /* ------------------------------- Tags ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl Tag {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Tag(s.to_string())
        }
    }

    impl From<String> for Tag {
        fn from(s: String) -> Self {
            Tag(s)
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Tags keep insertion order for rendering; duplicates collapse.
    pub type TagSet = IndexSet<Tag>;

    pub fn tag_set<I, S>(tags: I) -> TagSet
    where
        I: IntoIterator<Item = S>,
        S: Into<Tag>,
    {
        tags.into_iter().map(Into::into).collect()
    }

    /* ------------------------------ Scalars ------------------------------ */

    /// Value of an extension field.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Scalar {
        Bool(bool),
        Int(i64),
        Float(f64),
        Date(NaiveDate),
        Str(String),
    }

    impl Scalar {
        /// Interpret free text, preferring bool, integer, float, date, then string.
        pub fn parse(text: &str) -> Scalar {
            match text {
                "true" => return Scalar::Bool(true),
                "false" => return Scalar::Bool(false),
                _ => {}
            }
            if let Ok(n) = text.parse::<i64>() {
                return Scalar::Int(n);
            }
            // f64 accepts "inf" and "nan"; those stay strings.
            if text.bytes().any(|b| b.is_ascii_digit()) {
                if let Ok(x) = text.parse::<f64>() {
                    return Scalar::Float(x);
                }
            }
            if let Ok(d) = NaiveDate::parse_from_str(text, DATE_FORMAT) {
                return Scalar::Date(d);
            }
            Scalar::Str(text.to_string())
        }

        pub fn as_date(&self) -> Option<NaiveDate> {
            match self {
                Scalar::Date(d) => Some(*d),
                _ => None,
            }
        }

        pub fn as_int(&self) -> Option<i64> {
            match self {
                Scalar::Int(n) => Some(*n),
                _ => None,
            }
        }

        pub fn as_bool(&self) -> Option<bool> {
            match self {
                Scalar::Bool(b) => Some(*b),
                _ => None,
            }
        }

        pub fn as_str(&self) -> Option<&str> {
            match self {
                Scalar::Str(s) => Some(s),
                _ => None,
            }
        }
    }

    impl fmt::Display for Scalar {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Scalar::Bool(b) => write!(f, "{}", b),
                Scalar::Int(n) => write!(f, "{}", n),
                Scalar::Float(x) => write!(f, "{}", x),
                Scalar::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
                Scalar::Str(s) => f.write_str(s),
            }
        }
    }

    /* ------------------------------ Stamps ------------------------------ */

    pub const DATE_FORMAT: &str = "%Y-%m-%d";

    /// Canonical on-disk instant format.
    pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    /// Accepts space or `T` separators, optional seconds and fractional seconds.
    pub fn parse_stamp(text: &str) -> Option<NaiveDateTime> {
        const FORMATS: [&str; 4] = [
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M",
            "%Y-%m-%dT%H:%M",
        ];
        let text = text.trim();
        FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    }

    mod serde_stamp {
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(&value.format(super::STAMP_FORMAT))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = String::deserialize(deserializer)?;
            super::parse_stamp(&raw)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp {:?}", raw)))
        }
    }

    mod serde_stamp_opt {
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(stamp) => serializer.collect_str(&stamp.format(super::STAMP_FORMAT)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse_stamp(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid timestamp {:?}", raw))),
                None => Ok(None),
            }
        }
    }

    /* --------------------------- Entry template --------------------------- */

    /// Keys with a fixed meaning on a record; they never land in `extensions`.
    pub const RESERVED_KEYS: [&str; 8] = [
        "date", "desc", "tags", "note", "tstamp", "tfinish", "tclock", "due",
    ];

    /// Fields shared by live records and schedule templates.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct EntryFields {
        #[serde(default)]
        pub desc: Option<String>,

        /// `None` and an empty set are distinct: only the former fails tag filters.
        #[serde(default)]
        pub tags: Option<TagSet>,

        #[serde(default)]
        pub note: Option<String>,

        #[serde(default, with = "serde_stamp_opt")]
        pub tstamp: Option<NaiveDateTime>,

        #[serde(default, with = "serde_stamp_opt")]
        pub tfinish: Option<NaiveDateTime>,

        /// Explicit minutes; wins over the stamps.
        #[serde(default)]
        pub tclock: Option<i64>,

        #[serde(default)]
        pub due: Option<NaiveDate>,

        #[serde(flatten)]
        pub extensions: IndexMap<String, Scalar>,
    }

    impl EntryFields {
        /// Shallow merge of parsed `key:value` fields.
        pub fn merge_fields(&mut self, fields: IndexMap<String, Scalar>) {
            for (key, value) in fields {
                if let Some(value) = self.lift(&key, value) {
                    self.extensions.insert(key, value);
                }
            }
        }

        /// Moves a known key into its typed slot. Returns the value back when it belongs
        /// in `extensions`.
        fn lift(&mut self, key: &str, value: Scalar) -> Option<Scalar> {
            match (key, value) {
                ("desc", v) => self.desc = Some(v.to_string()),
                ("note", v) => self.note = Some(v.to_string()),
                ("due", Scalar::Date(d)) => self.due = Some(d),
                ("tclock", Scalar::Int(m)) if clock_minutes_in_range(m) => self.tclock = Some(m),
                (k, v) if RESERVED_KEYS.contains(&k) => {
                    tracing::warn!(key = k, value = %v, "ignoring field with unexpected type");
                }
                (_, v) => return Some(v),
            }
            None
        }
    }

    /// Minute counts must be non-negative and representable as a `Duration`.
    pub fn clock_minutes_in_range(minutes: i64) -> bool {
        minutes >= 0 && Duration::try_minutes(minutes).is_some()
    }

    /* ------------------------------- Records ------------------------------- */

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Record {
        #[serde(skip)]
        pub id: RecordId,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<NaiveDate>,

        #[serde(flatten)]
        pub fields: EntryFields,
    }

    /// Equality ignores the session handle.
    impl PartialEq for Record {
        fn eq(&self, other: &Self) -> bool {
            self.date == other.date && self.fields == other.fields
        }
    }

    impl Record {
        pub fn new(date: Option<NaiveDate>) -> Self {
            Self {
                id: RecordId::new(),
                date,
                fields: EntryFields::default(),
            }
        }

        /// Like `EntryFields::merge_fields`, additionally accepting a `date` field.
        pub fn merge_fields(&mut self, fields: IndexMap<String, Scalar>) {
            for (key, value) in fields {
                if key == "date" {
                    match value.as_date() {
                        Some(d) => self.date = Some(d),
                        None => tracing::warn!(value = %value, "ignoring non-date `date` field"),
                    }
                    continue;
                }
                if let Some(value) = self.fields.lift(&key, value) {
                    self.fields.extensions.insert(key, value);
                }
            }
        }

        pub fn has_tag(&self, tag: &str) -> bool {
            self.fields
                .tags
                .as_ref()
                .is_some_and(|tags| tags.iter().any(|t| t.as_str() == tag))
        }
    }

    /* ---------------------------- Schedule rules ---------------------------- */

    /// A record-in-waiting: fires into the todo list once `date` arrives.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ScheduleRule {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date: Option<NaiveDate>,

        /// Interval in days.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub repeat: Option<i64>,

        #[serde(default = "ScheduleRule::default_active")]
        pub active: bool,

        #[serde(flatten)]
        pub template: EntryFields,

        /// Day of the last firing in this process; keeps repeated runs on one day idempotent.
        #[serde(skip)]
        pub fired_on: Option<NaiveDate>,
    }

    impl ScheduleRule {
        fn default_active() -> bool {
            true
        }

        /// Turns a record into an active rule. A `repeat` extension becomes the interval.
        pub fn from_record(record: Record) -> Self {
            let mut template = record.fields;
            let repeat = match template.extensions.shift_remove("repeat") {
                Some(Scalar::Int(days)) => Some(days),
                Some(other) => {
                    tracing::warn!(value = %other, "ignoring non-integer repeat");
                    None
                }
                None => None,
            };
            template.extensions.shift_remove("active");
            Self {
                date: record.date,
                repeat,
                active: true,
                template,
                fired_on: None,
            }
        }

        /// Fresh record carrying the template fields and the rule's current date.
        pub fn materialize(&self) -> Record {
            Record {
                id: RecordId::new(),
                date: self.date,
                fields: self.template.clone(),
            }
        }
    }

    /* -------------------------------- Tics -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tic(#[serde(with = "serde_stamp")] pub NaiveDateTime);

    /* ------------------------------ Document ------------------------------ */

    /// Everything persisted in one ledger file.
    #[serde_with::serde_as]
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct LedgerDocument {
        #[serde_as(as = "serde_with::DefaultOnNull")]
        #[serde(default)]
        pub log: Vec<Record>,

        #[serde_as(as = "serde_with::DefaultOnNull")]
        #[serde(default)]
        pub todo: Vec<Record>,

        #[serde_as(as = "serde_with::DefaultOnNull")]
        #[serde(default)]
        pub scheduled: Vec<ScheduleRule>,

        #[serde_as(as = "serde_with::DefaultOnNull")]
        #[serde(default)]
        pub tics: Vec<Tic>,

        #[serde_as(as = "serde_with::DefaultOnNull")]
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub catch: Vec<Record>,
    }

    /* ------------------------------ Errors ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LedgerError {
        #[error("position {position} is out of range ({len} records)")]
        OutOfRange { position: usize, len: usize },
        #[error("no record with id {0}")]
        UnknownRecord(RecordId),
        #[error("invalid clock value {0:?} (expected MM or H:MM)")]
        InvalidClock(String),
        #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
        InvalidDate(String),
        #[error("clock of {0} minutes is out of range")]
        ClockOutOfRange(i64),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn scalar_preference_order() {
            assert_eq!(Scalar::parse("true"), Scalar::Bool(true));
            assert_eq!(Scalar::parse("42"), Scalar::Int(42));
            assert_eq!(Scalar::parse("-3"), Scalar::Int(-3));
            assert_eq!(Scalar::parse("1.5"), Scalar::Float(1.5));
            assert_eq!(Scalar::parse("2016-07-10"), Scalar::Date(day(2016, 7, 10)));
            assert_eq!(Scalar::parse("nan"), Scalar::Str("nan".into()));
            assert_eq!(Scalar::parse("2016-02-30"), Scalar::Str("2016-02-30".into()));
        }

        #[test]
        fn stamps_accept_legacy_forms() {
            let want = day(2016, 7, 4).and_hms_opt(9, 30, 0).unwrap();
            assert_eq!(parse_stamp("2016-07-04 09:30:00"), Some(want));
            assert_eq!(parse_stamp("2016-07-04T09:30:00"), Some(want));
            assert_eq!(parse_stamp("2016-07-04 09:30"), Some(want));
            let frac = parse_stamp("2016-07-04 09:30:00.250000").expect("fractional");
            assert_eq!(frac.and_utc().timestamp(), want.and_utc().timestamp());
            assert_eq!(parse_stamp("yesterday"), None);
        }

        #[test]
        fn merge_lifts_known_keys() {
            let mut rec = Record::new(None);
            let mut fields = IndexMap::new();
            fields.insert("due".to_string(), Scalar::Date(day(2016, 7, 10)));
            fields.insert("tclock".to_string(), Scalar::Int(30));
            fields.insert("date".to_string(), Scalar::Date(day(2016, 7, 4)));
            fields.insert("where".to_string(), Scalar::Str("office".into()));
            fields.insert("tstamp".to_string(), Scalar::Int(1));
            rec.merge_fields(fields);

            assert_eq!(rec.date, Some(day(2016, 7, 4)));
            assert_eq!(rec.fields.due, Some(day(2016, 7, 10)));
            assert_eq!(rec.fields.tclock, Some(30));
            assert_eq!(rec.fields.tstamp, None);
            assert_eq!(rec.fields.extensions.len(), 1);
            assert_eq!(
                rec.fields.extensions.get("where"),
                Some(&Scalar::Str("office".into()))
            );
        }

        #[test]
        fn merge_drops_unusable_tclock() {
            for minutes in [-5, 999_999_999_999_999] {
                let mut rec = Record::new(None);
                let mut fields = IndexMap::new();
                fields.insert("tclock".to_string(), Scalar::Int(minutes));
                rec.merge_fields(fields);
                assert_eq!(rec.fields.tclock, None, "tclock:{} should be dropped", minutes);
                assert!(rec.fields.extensions.is_empty());
            }
        }

        #[test]
        fn rule_from_record_lifts_repeat() {
            let mut rec = Record::new(Some(day(2030, 1, 1)));
            rec.fields.desc = Some("rent".into());
            rec.fields.extensions.insert("repeat".into(), Scalar::Int(30));
            rec.fields.extensions.insert("active".into(), Scalar::Bool(false));

            let rule = ScheduleRule::from_record(rec);
            assert_eq!(rule.repeat, Some(30));
            assert!(rule.active);
            assert!(rule.template.extensions.is_empty());

            let fired = rule.materialize();
            assert_eq!(fired.date, Some(day(2030, 1, 1)));
            assert_eq!(fired.fields.desc.as_deref(), Some("rent"));
        }

        #[test]
        fn record_equality_ignores_handle() {
            let a = Record::new(Some(day(2016, 7, 4)));
            let mut b = a.clone();
            b.id = RecordId::new();
            assert_ne!(a.id, b.id);
            assert_eq!(a, b);
        }
    }
}

pub mod codec {
    //! Compact one-line syntax: `DATE desc +tag1 +tag2 key:value`.
    //!
    //! - A leading `YYYY-MM-DD` followed by whitespace (or nothing) is the date.
    //! - `" +"` separates tags; a tag is one word, words after it go back to the description.
    //! - `key:value` words in the description become scalar fields.
    //!
    //! Nothing here fails on malformed input; odd text stays in the description.

    use crate::core::{LedgerError, Record, Scalar, Tag, TagSet, DATE_FORMAT};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_while, take_while_m_n, take_while1},
        character::complete::{char, multispace1},
        combinator::{eof, map_res, recognize, verify},
        error::VerboseError,
        sequence::{pair, separated_pair, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Result of reading one compact line.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Parsed {
        pub desc: Option<String>,
        pub tags: Option<TagSet>,
        pub date: Option<NaiveDate>,
        pub fields: IndexMap<String, Scalar>,
    }

    pub fn parse(text: &str) -> Parsed {
        let (body, date) = match leading_date(text) {
            Ok((rest, date)) => (rest, Some(date)),
            Err(_) => (text, None),
        };
        let (candidate, tags) = split_tags(body);
        let (desc, fields) = extract_fields(&candidate);
        Parsed {
            desc,
            tags,
            date,
            fields,
        }
    }

    /// Strict `YYYY-MM-DD` for command arguments such as `--after`.
    pub fn parse_date_arg(text: &str) -> Result<NaiveDate, LedgerError> {
        terminated(parse_date, eof)(text.trim())
            .map(|(_, d)| d)
            .map_err(|_| LedgerError::InvalidDate(text.to_string()))
    }

    pub fn render(record: &Record) -> String {
        render_parts(
            record.date,
            record.fields.desc.as_deref(),
            record.fields.tags.as_ref(),
        )
    }

    pub fn render_parts(date: Option<NaiveDate>, desc: Option<&str>, tags: Option<&TagSet>) -> String {
        let mut out = String::new();
        if let Some(d) = date {
            out.push_str(&d.format(DATE_FORMAT).to_string());
        }
        if let Some(desc) = desc.filter(|d| !d.is_empty()) {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(desc);
        }
        for tag in tags.into_iter().flatten() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push('+');
            out.push_str(tag.as_str());
        }
        out
    }

    /* ----------------------------- Date prefix ----------------------------- */

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn leading_date(i: &str) -> PResult<'_, NaiveDate> {
        terminated(parse_date, alt((multispace1, eof)))(i)
    }

    /* -------------------------------- Tags -------------------------------- */

    /// Splits on `" +"`. Returns the description candidate and the tags, `None` when no
    /// tag name was found.
    fn split_tags(body: &str) -> (String, Option<TagSet>) {
        let (mut desc, tail) = match body.strip_prefix('+') {
            Some(rest) => (String::new(), rest),
            None => match body.split_once(" +") {
                Some((head, rest)) => (head.to_string(), rest),
                None => return (body.to_string(), None),
            },
        };

        let mut tags = TagSet::new();
        for segment in tail.split(" +") {
            let (name, spill) = segment
                .split_once(char::is_whitespace)
                .unwrap_or((segment, ""));
            if name.is_empty() {
                // a lone `+` is text
                push_text(&mut desc, &format!("+{}", segment));
            } else {
                tags.insert(Tag::from(name));
                push_text(&mut desc, spill);
            }
        }
        let tags = if tags.is_empty() { None } else { Some(tags) };
        (desc, tags)
    }

    /// Appends `piece` with a single separating space; inner spacing is kept.
    fn push_text(desc: &mut String, piece: &str) {
        let piece = piece.trim();
        if piece.is_empty() {
            return;
        }
        desc.truncate(desc.trim_end().len());
        if !desc.is_empty() {
            desc.push(' ');
        }
        desc.push_str(piece);
    }

    /* ------------------------------- Fields ------------------------------- */

    fn identifier(i: &str) -> PResult<'_, &str> {
        recognize(pair(
            take_while_m_n(1, 1, |c: char| c.is_ascii_lowercase() || c == '_'),
            take_while(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
        ))(i)
    }

    /// `key:value` with a non-empty value; values starting with `/` are left alone so
    /// `https://...` stays text.
    fn field_token(i: &str) -> PResult<'_, (&str, &str)> {
        separated_pair(
            identifier,
            char(':'),
            verify(take_while1(|c: char| !c.is_whitespace()), |v: &str| {
                !v.starts_with('/')
            }),
        )(i)
    }

    /// Removes field words and the gap in front of each, keeping the rest of the text as is.
    fn extract_fields(candidate: &str) -> (Option<String>, IndexMap<String, Scalar>) {
        let mut fields = IndexMap::new();
        let mut desc = String::new();
        let mut dropped_gap: Option<&str> = None;
        let mut rest = candidate;
        loop {
            let word_start = rest.trim_start();
            if word_start.is_empty() {
                break;
            }
            let gap = &rest[..rest.len() - word_start.len()];
            let end = word_start
                .find(char::is_whitespace)
                .unwrap_or(word_start.len());
            let (word, after) = word_start.split_at(end);
            match terminated(field_token, eof)(word) {
                Ok((_, (key, value))) => {
                    fields.insert(key.to_string(), Scalar::parse(value));
                    dropped_gap.get_or_insert(gap);
                }
                Err(_) => {
                    let gap = dropped_gap.take().unwrap_or(gap);
                    if !desc.is_empty() {
                        desc.push_str(gap);
                    }
                    desc.push_str(word);
                }
            }
            rest = after;
        }
        let desc = if desc.is_empty() { None } else { Some(desc) };
        (desc, fields)
    }

}

pub mod clock {
    //! Elapsed-time arithmetic. An explicit `tclock` (minutes) always wins over stamps.

    use crate::core::{LedgerError, Record, clock_minutes_in_range};
    use chrono::{Duration, NaiveDateTime};
    use tracing::warn;

    /// True when a duration can be derived.
    pub fn has_clock(rec: &Record) -> bool {
        duration(rec).is_some()
    }

    /// Started and neither finished nor overridden by minutes.
    pub fn has_open_clock(rec: &Record) -> bool {
        rec.fields.tstamp.is_some() && rec.fields.tfinish.is_none() && rec.fields.tclock.is_none()
    }

    /// An unrepresentable `tclock` (hand-edited files) counts as no clock.
    pub fn duration(rec: &Record) -> Option<Duration> {
        if let Some(minutes) = rec.fields.tclock {
            return Duration::try_minutes(minutes);
        }
        match (rec.fields.tstamp, rec.fields.tfinish) {
            (Some(start), Some(finish)) => Some(finish - start),
            _ => None,
        }
    }

    pub fn start(rec: &mut Record, now: NaiveDateTime) {
        rec.fields.tstamp = Some(now);
    }

    pub fn finish(rec: &mut Record, now: NaiveDateTime) {
        rec.fields.tfinish = Some(now);
    }

    /// Back-dates the start so the record spans the last `minutes`. Leaves the record
    /// untouched when the start would fall outside the calendar.
    pub fn mark_elapsed(
        rec: &mut Record,
        minutes: i64,
        now: NaiveDateTime,
    ) -> Result<(), LedgerError> {
        let start = Duration::try_minutes(minutes)
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or(LedgerError::ClockOutOfRange(minutes))?;
        rec.fields.tstamp = Some(start);
        rec.fields.tfinish = Some(now);
        Ok(())
    }

    /// Adds minutes on top of whatever the record already holds and returns the new total.
    /// Stamps stay in place; `tclock` overrides them from now on.
    pub fn accumulate(rec: &mut Record, extra: i64) -> Result<Duration, LedgerError> {
        let current = duration(rec).map(|d| d.num_minutes()).unwrap_or(0);
        let total = current
            .checked_add(extra)
            .filter(|m| clock_minutes_in_range(*m))
            .ok_or(LedgerError::ClockOutOfRange(extra))?;
        rec.fields.tclock = Some(total);
        Ok(Duration::minutes(total))
    }

    pub fn total<'a, I>(records: I) -> Duration
    where
        I: IntoIterator<Item = &'a Record>,
    {
        records
            .into_iter()
            .filter_map(duration)
            .fold(Duration::zero(), |acc, d| match acc.checked_add(&d) {
                Some(sum) => sum,
                None => {
                    warn!(minutes = d.num_minutes(), "clock total overflowed; skipping record");
                    acc
                }
            })
    }

    /// Elapsed time of an open clock, truncated to whole seconds.
    pub fn open_for(rec: &Record, now: NaiveDateTime) -> Option<Duration> {
        if !has_open_clock(rec) {
            return None;
        }
        let start = rec.fields.tstamp?;
        Some(Duration::seconds((now - start).num_seconds()))
    }

    /// `MM` or `H:MM`.
    pub fn parse_clock(text: &str) -> Result<i64, LedgerError> {
        fn digits(s: &str) -> Option<i64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        }

        fn hours_minutes(s: &str) -> Option<i64> {
            let (h, m) = s.split_once(':')?;
            let (h, m) = (digits(h)?, digits(m)?);
            if m >= 60 {
                return None;
            }
            h.checked_mul(60)?.checked_add(m)
        }

        let trimmed = text.trim();
        let minutes = if trimmed.contains(':') {
            hours_minutes(trimmed)
        } else {
            digits(trimmed)
        };
        minutes
            .filter(|m| clock_minutes_in_range(*m))
            .ok_or_else(|| LedgerError::InvalidClock(text.to_string()))
    }

    /// `H:MM:SS`, with a leading `-` for negative spans.
    pub fn format_duration(d: Duration) -> String {
        let secs = d.num_seconds();
        let sign = if secs < 0 { "-" } else { "" };
        let secs = secs.abs();
        format!(
            "{}{}:{:02}:{:02}",
            sign,
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }

}

pub mod filter {
    //! Record predicates. Constructors return `None` for "no constraint" so callers can
    //! collect the `Some`s and AND them together.

    use crate::core::{Record, Tag};
    use chrono::NaiveDate;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TagSpec {
        pub required: Vec<Tag>,
        pub forbidden: Vec<Tag>,
    }

    impl TagSpec {
        /// `tag` requires, `~tag` forbids.
        pub fn parse<I, S>(tokens: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: AsRef<str>,
        {
            let mut spec = TagSpec::default();
            for token in tokens {
                let token = token.as_ref();
                match token.strip_prefix('~') {
                    Some(name) => spec.forbidden.push(Tag::from(name)),
                    None => spec.required.push(Tag::from(token)),
                }
            }
            spec
        }

        pub fn is_empty(&self) -> bool {
            self.required.is_empty() && self.forbidden.is_empty()
        }

        /// Records without a `tags` field never match.
        pub fn matches(&self, rec: &Record) -> bool {
            let Some(tags) = rec.fields.tags.as_ref() else {
                return false;
            };
            self.required.iter().all(|t| tags.contains(t))
                && !self.forbidden.iter().any(|t| tags.contains(t))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Filter {
        /// Inclusive on both ends.
        DateRange {
            from: Option<NaiveDate>,
            to: Option<NaiveDate>,
        },
        Tags(TagSpec),
    }

    impl Filter {
        pub fn matches(&self, rec: &Record) -> bool {
            match self {
                Filter::DateRange { from, to } => match rec.date {
                    Some(date) => {
                        from.is_none_or(|lo| date >= lo) && to.is_none_or(|hi| date <= hi)
                    }
                    None => false,
                },
                Filter::Tags(spec) => spec.matches(rec),
            }
        }
    }

    pub fn date_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<Filter> {
        if from.is_none() && to.is_none() {
            return None;
        }
        Some(Filter::DateRange { from, to })
    }

    pub fn on_day(day: NaiveDate) -> Filter {
        Filter::DateRange {
            from: Some(day),
            to: Some(day),
        }
    }

    pub fn tag_spec<I, S>(tokens: I) -> Option<Filter>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let spec = TagSpec::parse(tokens);
        if spec.is_empty() {
            None
        } else {
            Some(Filter::Tags(spec))
        }
    }

    pub fn matches_all(filters: &[Filter], rec: &Record) -> bool {
        filters.iter().all(|f| f.matches(rec))
    }

}

pub mod store {
    //! Ordered record collections addressed by `RecordId` handles.
    //! Positions (0-based, from the start) are resolved to handles with `id_at`.

    use crate::clock;
    use crate::codec::Parsed;
    use crate::core::{LedgerError, Record, RecordId, Scalar, TagSet};
    use crate::filter::{Filter, matches_all};
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use indexmap::IndexMap;

    /// Partial update: `None` leaves the record's value alone; `fields` merge shallowly.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct RecordPatch {
        pub desc: Option<String>,
        pub date: Option<NaiveDate>,
        pub tags: Option<TagSet>,
        pub fields: IndexMap<String, Scalar>,
    }

    impl RecordPatch {
        pub fn is_empty(&self) -> bool {
            self.desc.is_none() && self.date.is_none() && self.tags.is_none() && self.fields.is_empty()
        }

        pub fn apply_to(self, rec: &mut Record) {
            if let Some(desc) = self.desc {
                rec.fields.desc = Some(desc);
            }
            if let Some(date) = self.date {
                rec.date = Some(date);
            }
            if let Some(tags) = self.tags {
                rec.fields.tags = Some(tags);
            }
            rec.merge_fields(self.fields);
        }
    }

    impl From<Parsed> for RecordPatch {
        fn from(p: Parsed) -> Self {
            Self {
                desc: p.desc,
                date: p.date,
                tags: p.tags,
                fields: p.fields,
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct RecordStore {
        records: Vec<Record>,
    }

    impl RecordStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_records(records: Vec<Record>) -> Self {
            Self { records }
        }

        pub fn into_records(self) -> Vec<Record> {
            self.records
        }

        pub fn records(&self) -> &[Record] {
            &self.records
        }

        pub fn len(&self) -> usize {
            self.records.len()
        }

        pub fn is_empty(&self) -> bool {
            self.records.is_empty()
        }

        /// Appends an empty record and applies the given fields to it.
        pub fn add(
            &mut self,
            desc: Option<String>,
            date: Option<NaiveDate>,
            tags: Option<TagSet>,
            fields: IndexMap<String, Scalar>,
        ) -> RecordId {
            self.add_with(RecordPatch {
                desc,
                date,
                tags,
                fields,
            })
        }

        pub fn add_with(&mut self, patch: RecordPatch) -> RecordId {
            let mut rec = Record::new(None);
            patch.apply_to(&mut rec);
            self.push(rec)
        }

        pub fn push(&mut self, rec: Record) -> RecordId {
            let id = rec.id;
            self.records.push(rec);
            id
        }

        pub fn update(&mut self, id: RecordId, patch: RecordPatch) -> Result<(), LedgerError> {
            let rec = self.get_mut(id)?;
            patch.apply_to(rec);
            Ok(())
        }

        pub fn delete(&mut self, id: RecordId) -> Result<Record, LedgerError> {
            let pos = self.position_of(id)?;
            Ok(self.records.remove(pos))
        }

        pub fn note(&mut self, id: RecordId, text: impl Into<String>) -> Result<(), LedgerError> {
            self.get_mut(id)?.fields.note = Some(text.into());
            Ok(())
        }

        pub fn get(&self, id: RecordId) -> Result<&Record, LedgerError> {
            self.records
                .iter()
                .find(|r| r.id == id)
                .ok_or(LedgerError::UnknownRecord(id))
        }

        pub fn get_mut(&mut self, id: RecordId) -> Result<&mut Record, LedgerError> {
            self.records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(LedgerError::UnknownRecord(id))
        }

        pub fn position_of(&self, id: RecordId) -> Result<usize, LedgerError> {
            self.records
                .iter()
                .position(|r| r.id == id)
                .ok_or(LedgerError::UnknownRecord(id))
        }

        pub fn id_at(&self, position: usize) -> Result<RecordId, LedgerError> {
            self.records
                .get(position)
                .map(|r| r.id)
                .ok_or(LedgerError::OutOfRange {
                    position,
                    len: self.records.len(),
                })
        }

        pub fn last_id(&self) -> Option<RecordId> {
            self.records.last().map(|r| r.id)
        }

        /// Like `last_id`, but an empty store is an error.
        pub fn require_last(&self) -> Result<RecordId, LedgerError> {
            self.last_id()
                .ok_or(LedgerError::OutOfRange { position: 0, len: 0 })
        }

        /// Matching records in store order.
        pub fn filtered(&self, filters: &[Filter]) -> Vec<&Record> {
            self.records
                .iter()
                .filter(|r| matches_all(filters, r))
                .collect()
        }

        pub fn view_recent(&self, n: usize, now: NaiveDateTime) -> RecentView<'_> {
            let start = self.records.len().saturating_sub(n);
            RecentView {
                records: &self.records[start..],
                open_for: self.records.last().and_then(|r| clock::open_for(r, now)),
            }
        }
    }

    /// Tail of the store plus how long the very last record has been running.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecentView<'a> {
        pub records: &'a [Record],
        pub open_for: Option<Duration>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct CalendarGroup<'a> {
        pub date: Option<NaiveDate>,
        pub records: Vec<&'a Record>,
    }

    /// Groups runs of equal dates. Input is expected to be date-ordered; unordered input
    /// yields repeated headers rather than being sorted here.
    pub fn calendar_groups<'a, I>(records: I) -> Vec<CalendarGroup<'a>>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut groups: Vec<CalendarGroup<'a>> = Vec::new();
        for rec in records {
            if groups.last().is_some_and(|g| g.date == rec.date) {
                if let Some(group) = groups.last_mut() {
                    group.records.push(rec);
                }
            } else {
                groups.push(CalendarGroup {
                    date: rec.date,
                    records: vec![rec],
                });
            }
        }
        groups
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::codec;
        use crate::core::tag_set;
        use crate::filter::tag_spec;

        fn day(d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2016, 7, d).unwrap()
        }

        fn sample() -> RecordStore {
            let mut store = RecordStore::new();
            for line in [
                "2016-07-01 first +work",
                "2016-07-01 second +home",
                "2016-07-02 third +work",
            ] {
                store.add_with(codec::parse(line).into());
            }
            store
        }

        #[test]
        fn add_applies_fields() {
            let mut store = RecordStore::new();
            let mut fields = IndexMap::new();
            fields.insert("due".to_string(), Scalar::Date(day(9)));
            fields.insert("effort".to_string(), Scalar::Int(2));
            let id = store.add(Some("plan".into()), Some(day(1)), None, fields);

            let rec = store.get(id).expect("added");
            assert_eq!(rec.fields.desc.as_deref(), Some("plan"));
            assert_eq!(rec.fields.due, Some(day(9)));
            assert_eq!(rec.fields.extensions.get("effort"), Some(&Scalar::Int(2)));
            assert_eq!(store.last_id(), Some(id));
        }

        #[test]
        fn update_only_touches_provided_fields() {
            let mut store = sample();
            let id = store.id_at(0).expect("position 0");
            store
                .update(
                    id,
                    RecordPatch {
                        desc: Some("renamed".into()),
                        ..Default::default()
                    },
                )
                .expect("update");
            let rec = store.get(id).expect("present");
            assert_eq!(rec.fields.desc.as_deref(), Some("renamed"));
            assert_eq!(rec.date, Some(day(1)));
            assert_eq!(rec.fields.tags, Some(tag_set(["work"])));
        }

        #[test]
        fn bad_addresses_mutate_nothing() {
            let mut store = sample();
            let before = store.clone();
            assert_eq!(
                store.id_at(3),
                Err(LedgerError::OutOfRange { position: 3, len: 3 })
            );
            let stranger = RecordId::new();
            assert_eq!(store.delete(stranger), Err(LedgerError::UnknownRecord(stranger)));
            assert!(store.note(stranger, "x").is_err());
            assert_eq!(store, before);

            let empty = RecordStore::new();
            assert!(empty.require_last().is_err());
        }

        #[test]
        fn delete_by_position() {
            let mut store = sample();
            let id = store.id_at(1).expect("position 1");
            let gone = store.delete(id).expect("delete");
            assert_eq!(gone.fields.desc.as_deref(), Some("second"));
            assert_eq!(store.len(), 2);
            assert_eq!(
                store.records()[1].fields.desc.as_deref(),
                Some("third")
            );
        }

        #[test]
        fn filtered_keeps_order() {
            let store = sample();
            let filters: Vec<_> = tag_spec(["work"]).into_iter().collect();
            let hits: Vec<_> = store
                .filtered(&filters)
                .iter()
                .filter_map(|r| r.fields.desc.clone())
                .collect();
            assert_eq!(hits, vec!["first".to_string(), "third".to_string()]);
            assert_eq!(store.filtered(&[]).len(), 3);
        }

        #[test]
        fn calendar_groups_runs() {
            let store = sample();
            let groups = calendar_groups(store.records());
            assert_eq!(groups.len(), 2);
            assert_eq!(groups[0].date, Some(day(1)));
            assert_eq!(groups[0].records.len(), 2);
            assert_eq!(groups[1].records.len(), 1);
        }

        #[test]
        fn recent_view_reports_open_clock() {
            let mut store = sample();
            let now = day(2).and_hms_opt(12, 0, 0).unwrap();
            assert_eq!(store.view_recent(2, now).records.len(), 2);
            assert_eq!(store.view_recent(10, now).records.len(), 3);
            assert_eq!(store.view_recent(2, now).open_for, None);

            let id = store.require_last().expect("last");
            clock::start(
                store.get_mut(id).expect("present"),
                day(2).and_hms_opt(11, 15, 30).unwrap(),
            );
            assert_eq!(
                store.view_recent(2, now).open_for,
                Some(Duration::seconds(44 * 60 + 30))
            );
        }
    }
}

pub mod schedule {
    //! Turns matured schedule rules into todo records.

    use crate::core::{Record, RecordId, ScheduleRule};
    use crate::store::RecordStore;
    use chrono::{Duration, NaiveDate};
    use tracing::{debug, warn};

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Scheduler {
        rules: Vec<ScheduleRule>,
    }

    impl Scheduler {
        pub fn new(rules: Vec<ScheduleRule>) -> Self {
            Self { rules }
        }

        pub fn rules(&self) -> &[ScheduleRule] {
            &self.rules
        }

        pub fn into_rules(self) -> Vec<ScheduleRule> {
            self.rules
        }

        pub fn len(&self) -> usize {
            self.rules.len()
        }

        pub fn is_empty(&self) -> bool {
            self.rules.is_empty()
        }

        /// Stores `record` as an active rule; returns its index.
        pub fn schedule(&mut self, record: Record) -> usize {
            let rule = ScheduleRule::from_record(record);
            debug!(date = ?rule.date, repeat = ?rule.repeat, "scheduled rule");
            self.rules.push(rule);
            self.rules.len() - 1
        }

        pub fn rule_mut(&mut self, index: usize) -> Option<&mut ScheduleRule> {
            self.rules.get_mut(index)
        }

        /// Fires every active rule due on or before `today` into `todo`, at most once per
        /// rule per day. Repeating rules advance; the rest deactivate and are pruned.
        pub fn run(&mut self, todo: &mut RecordStore, today: NaiveDate) -> Vec<RecordId> {
            let mut fired = Vec::new();
            for rule in self.rules.iter_mut() {
                if !rule.active || rule.fired_on == Some(today) {
                    continue;
                }
                let Some(due) = rule.date else {
                    continue;
                };
                if due > today {
                    continue;
                }

                let record = rule.materialize();
                match rule.repeat {
                    Some(days) if days > 0 => {
                        match Duration::try_days(days).and_then(|d| due.checked_add_signed(d)) {
                            Some(next) => rule.date = Some(next),
                            None => {
                                warn!(days, date = %due, "repeat runs past the calendar; deactivating rule");
                                rule.active = false;
                            }
                        }
                    }
                    Some(days) => {
                        warn!(days, date = %due, "non-positive repeat; deactivating rule");
                        rule.active = false;
                    }
                    None => rule.active = false,
                }
                rule.fired_on = Some(today);
                debug!(date = %due, desc = ?record.fields.desc, "rule fired");
                fired.push(todo.push(record));
            }

            let before = self.rules.len();
            self.rules.retain(|r| r.active);
            if self.rules.len() != before {
                debug!(pruned = before - self.rules.len(), "pruned inactive rules");
            }
            fired
        }
    }

}

pub mod ledger {
    //! Command-level workflows over the four collections.

    use crate::clock;
    use crate::core::{LedgerDocument, LedgerError, Record, RecordId, Tic, clock_minutes_in_range};
    use crate::schedule::Scheduler;
    use crate::store::{RecordPatch, RecordStore};
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use tracing::debug;

    /// How a command sets the clock of the record it touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum ClockInput {
        /// Use the command's default behavior.
        #[default]
        Keep,
        /// Started this many minutes ago, finished now.
        Elapsed(i64),
        /// Explicit minutes.
        Minutes(i64),
    }

    /// Where an `add` ended up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Added {
        Todo(RecordId),
        Scheduled { index: usize, date: NaiveDate },
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Ledger {
        pub log: RecordStore,
        pub todo: RecordStore,
        pub catch: RecordStore,
        pub scheduler: Scheduler,
        pub tics: Vec<Tic>,
    }

    impl Ledger {
        pub fn from_document(doc: LedgerDocument) -> Self {
            Self {
                log: RecordStore::from_records(doc.log),
                todo: RecordStore::from_records(doc.todo),
                catch: RecordStore::from_records(doc.catch),
                scheduler: Scheduler::new(doc.scheduled),
                tics: doc.tics,
            }
        }

        pub fn into_document(self) -> LedgerDocument {
            LedgerDocument {
                log: self.log.into_records(),
                todo: self.todo.into_records(),
                scheduled: self.scheduler.into_rules(),
                tics: self.tics,
                catch: self.catch.into_records(),
            }
        }

        pub fn run_schedule(&mut self, today: NaiveDate) -> Vec<RecordId> {
            self.scheduler.run(&mut self.todo, today)
        }

        /// New todo dated `today` unless the patch says otherwise. A future date turns the
        /// entry into a schedule rule instead.
        pub fn add_todo(&mut self, patch: RecordPatch, today: NaiveDate) -> Added {
            let mut rec = Record::new(None);
            patch.apply_to(&mut rec);
            let date = *rec.date.get_or_insert(today);
            if date > today {
                let index = self.scheduler.schedule(rec);
                return Added::Scheduled { index, date };
            }
            Added::Todo(self.todo.push(rec))
        }

        pub fn delete_todo(&mut self, position: usize) -> Result<Record, LedgerError> {
            let id = self.todo.id_at(position)?;
            self.todo.delete(id)
        }

        /// Moves the todo at `position` into the log, dated today, with its clock running.
        pub fn start_todo(
            &mut self,
            position: usize,
            input: ClockInput,
            now: NaiveDateTime,
        ) -> Result<RecordId, LedgerError> {
            let id = self.todo.id_at(position)?;
            let mut rec = self.todo.get(id)?.clone();
            rec.date = Some(now.date());
            clock::start(&mut rec, now);
            apply_clock(&mut rec, input, now)?;
            self.todo.delete(id)?;
            debug!(%id, "todo moved to log");
            Ok(self.log.push(rec))
        }

        /// New log entry dated today unless given, clock started now.
        pub fn log_entry(
            &mut self,
            patch: RecordPatch,
            input: ClockInput,
            now: NaiveDateTime,
        ) -> Result<RecordId, LedgerError> {
            let mut rec = Record::new(None);
            patch.apply_to(&mut rec);
            rec.date.get_or_insert(now.date());
            clock::start(&mut rec, now);
            apply_clock(&mut rec, input, now)?;
            Ok(self.log.push(rec))
        }

        /// Updates the most recent log entry and closes its clock (or applies `input`).
        pub fn finish_last(
            &mut self,
            patch: RecordPatch,
            input: ClockInput,
            now: NaiveDateTime,
        ) -> Result<RecordId, LedgerError> {
            let id = self.log.require_last()?;
            let mut rec = self.log.get(id)?.clone();
            patch.apply_to(&mut rec);
            match input {
                ClockInput::Keep => clock::finish(&mut rec, now),
                other => apply_clock(&mut rec, other, now)?,
            }
            *self.log.get_mut(id)? = rec;
            Ok(id)
        }

        /// Returns the most recent log entry to the todo list with its clock cleared.
        pub fn undo_last(&mut self) -> Result<RecordId, LedgerError> {
            let id = self.log.require_last()?;
            let mut rec = self.log.delete(id)?;
            rec.fields.tstamp = None;
            rec.fields.tfinish = None;
            rec.fields.tclock = None;
            debug!(%id, "log entry moved back to todo");
            Ok(self.todo.push(rec))
        }

        /// Adds minutes to the most recent log entry; returns its new total.
        pub fn add_clock(&mut self, minutes: i64) -> Result<Duration, LedgerError> {
            let id = self.log.require_last()?;
            clock::accumulate(self.log.get_mut(id)?, minutes)
        }

        /// Quick-capture note, stamped now.
        pub fn capture(&mut self, patch: RecordPatch, now: NaiveDateTime) -> RecordId {
            let mut rec = Record::new(None);
            patch.apply_to(&mut rec);
            rec.date.get_or_insert(now.date());
            clock::start(&mut rec, now);
            self.catch.push(rec)
        }

        /// Records a tic; returns the time since the previous one.
        pub fn tic(&mut self, now: NaiveDateTime) -> Option<Duration> {
            let since = self.tics.last().map(|prev| now - prev.0);
            self.tics.push(Tic(now));
            since
        }
    }

    fn apply_clock(
        rec: &mut Record,
        input: ClockInput,
        now: NaiveDateTime,
    ) -> Result<(), LedgerError> {
        match input {
            ClockInput::Keep => {}
            ClockInput::Elapsed(minutes) => clock::mark_elapsed(rec, minutes, now)?,
            ClockInput::Minutes(minutes) if clock_minutes_in_range(minutes) => {
                rec.fields.tclock = Some(minutes)
            }
            ClockInput::Minutes(minutes) => return Err(LedgerError::ClockOutOfRange(minutes)),
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::codec;

        fn day(d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2016, 7, d).unwrap()
        }

        fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
            day(d).and_hms_opt(h, m, 0).unwrap()
        }

        fn patch(text: &str) -> RecordPatch {
            codec::parse(text).into()
        }

        #[test]
        fn future_add_becomes_rule() {
            let mut ledger = Ledger::default();
            let added = ledger.add_todo(patch("2016-07-10 dentist +health"), day(4));
            assert_eq!(added, Added::Scheduled { index: 0, date: day(10) });
            assert!(ledger.todo.is_empty());
            assert_eq!(ledger.scheduler.len(), 1);

            let fired = ledger.run_schedule(day(10));
            assert_eq!(fired.len(), 1);
            assert!(ledger.scheduler.is_empty());
            assert!(ledger.todo.get(fired[0]).expect("fired").has_tag("health"));
        }

        #[test]
        fn add_defaults_to_today() {
            let mut ledger = Ledger::default();
            let Added::Todo(id) = ledger.add_todo(patch("buy milk"), day(4)) else {
                panic!("expected a todo");
            };
            assert_eq!(ledger.todo.get(id).expect("todo").date, Some(day(4)));
        }

        #[test]
        fn do_then_undo_transplants() {
            let mut ledger = Ledger::default();
            ledger.add_todo(patch("first"), day(1));
            ledger.add_todo(patch("second"), day(1));

            let id = ledger
                .start_todo(1, ClockInput::Keep, at(4, 9, 0))
                .expect("start");
            assert_eq!(ledger.todo.len(), 1);
            let rec = ledger.log.get(id).expect("logged");
            assert_eq!(rec.date, Some(day(4)));
            assert!(clock::has_open_clock(rec));

            let back = ledger.undo_last().expect("undo");
            assert!(ledger.log.is_empty());
            let rec = ledger.todo.get(back).expect("back in todo");
            assert_eq!(rec.fields.desc.as_deref(), Some("second"));
            assert_eq!(rec.fields.tstamp, None);
            assert_eq!(ledger.todo.len(), 2);
        }

        #[test]
        fn do_out_of_range_changes_nothing() {
            let mut ledger = Ledger::default();
            ledger.add_todo(patch("only"), day(1));
            let before = ledger.clone();
            assert_eq!(
                ledger.start_todo(5, ClockInput::Keep, at(4, 9, 0)),
                Err(LedgerError::OutOfRange { position: 5, len: 1 })
            );
            assert_eq!(ledger, before);
        }

        #[test]
        fn log_and_finish() {
            let mut ledger = Ledger::default();
            let id = ledger
                .log_entry(patch("write +work"), ClockInput::Keep, at(4, 9, 0))
                .expect("log");
            let done = ledger
                .finish_last(patch("write report"), ClockInput::Keep, at(4, 9, 45))
                .expect("finish");
            assert_eq!(id, done);
            let rec = ledger.log.get(id).expect("logged");
            assert_eq!(rec.fields.desc.as_deref(), Some("write report"));
            assert!(rec.has_tag("work"));
            assert_eq!(clock::duration(rec), Some(Duration::minutes(45)));
        }

        #[test]
        fn clock_inputs() {
            let mut ledger = Ledger::default();
            let id = ledger
                .log_entry(patch("call"), ClockInput::Elapsed(30), at(4, 10, 0))
                .expect("log");
            assert_eq!(ledger.log.get(id).expect("logged").fields.tstamp, Some(at(4, 9, 30)));

            let id = ledger
                .log_entry(patch("meeting"), ClockInput::Minutes(50), at(4, 11, 0))
                .expect("log");
            assert_eq!(ledger.add_clock(10), Ok(Duration::minutes(60)));
            assert_eq!(
                clock::duration(ledger.log.get(id).expect("logged")),
                Some(Duration::minutes(60))
            );
        }

        #[test]
        fn oversized_clocks_change_nothing() {
            let mut ledger = Ledger::default();
            ledger.add_todo(patch("pending"), day(1));
            ledger
                .log_entry(patch("open"), ClockInput::Keep, at(4, 9, 0))
                .expect("log");
            let before = ledger.clone();

            let huge = 999_999_999_999;
            assert_eq!(
                ledger.log_entry(patch("x"), ClockInput::Elapsed(huge), at(4, 10, 0)),
                Err(LedgerError::ClockOutOfRange(huge))
            );
            assert_eq!(
                ledger.log_entry(patch("y"), ClockInput::Minutes(-5), at(4, 10, 0)),
                Err(LedgerError::ClockOutOfRange(-5))
            );
            assert_eq!(
                ledger.start_todo(0, ClockInput::Elapsed(huge), at(4, 10, 0)),
                Err(LedgerError::ClockOutOfRange(huge))
            );
            assert_eq!(
                ledger.finish_last(patch("renamed"), ClockInput::Elapsed(huge), at(4, 10, 0)),
                Err(LedgerError::ClockOutOfRange(huge))
            );
            assert_eq!(
                ledger.add_clock(i64::MAX),
                Err(LedgerError::ClockOutOfRange(i64::MAX))
            );
            assert_eq!(ledger, before);
        }

        #[test]
        fn empty_log_commands_fail() {
            let mut ledger = Ledger::default();
            assert!(ledger.undo_last().is_err());
            assert!(ledger.add_clock(5).is_err());
            assert!(
                ledger
                    .finish_last(RecordPatch::default(), ClockInput::Keep, at(4, 9, 0))
                    .is_err()
            );
        }

        #[test]
        fn tics_report_gap() {
            let mut ledger = Ledger::default();
            assert_eq!(ledger.tic(at(4, 9, 0)), None);
            assert_eq!(ledger.tic(at(4, 9, 25)), Some(Duration::minutes(25)));
            assert_eq!(ledger.tics.len(), 2);
        }

        #[test]
        fn capture_goes_to_catch() {
            let mut ledger = Ledger::default();
            let id = ledger.capture(patch("idea +later"), at(4, 9, 0));
            let rec = ledger.catch.get(id).expect("captured");
            assert_eq!(rec.date, Some(day(4)));
            assert_eq!(rec.fields.tstamp, Some(at(4, 9, 0)));
            assert!(ledger.log.is_empty());
        }

        #[test]
        fn document_round_trip_keeps_collections() {
            let mut ledger = Ledger::default();
            ledger.add_todo(patch("a"), day(1));
            ledger.add_todo(patch("2016-08-01 b"), day(1));
            ledger
                .log_entry(patch("c"), ClockInput::Keep, at(1, 8, 0))
                .expect("log");
            let doc = ledger.clone().into_document();
            assert_eq!(doc.todo.len(), 1);
            assert_eq!(doc.scheduled.len(), 1);
            assert_eq!(doc.log.len(), 1);
            assert_eq!(Ledger::from_document(doc), ledger);
        }
    }
}

pub mod render {
    //! Rendering-ready snapshots and plain/ANSI line layouts.

    use crate::clock;
    use crate::core::{DATE_FORMAT, Record, Scalar};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::Serialize;

    /* ------------------------------ Urgency ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Urgency {
        Overdue,
        Today,
        Soon,
        Later,
    }

    /// `Soon` covers the next `soon_days` days after today.
    pub fn classify_due(due: NaiveDate, today: NaiveDate, soon_days: i64) -> Urgency {
        let days = (due - today).num_days();
        if days < 0 {
            Urgency::Overdue
        } else if days == 0 {
            Urgency::Today
        } else if days <= soon_days {
            Urgency::Soon
        } else {
            Urgency::Later
        }
    }

    /* ------------------------------ Snapshot ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct RecordView {
        /// Position within the listing (the number `del`/`do` accept for todos).
        pub position: usize,
        pub date: Option<NaiveDate>,
        pub desc: Option<String>,
        pub tags: Vec<String>,
        pub due: Option<NaiveDate>,
        pub urgency: Option<Urgency>,
        /// `H:MM:SS` when the record carries a clock.
        pub duration: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub note_lines: Vec<String>,
        #[serde(skip_serializing_if = "IndexMap::is_empty")]
        pub extensions: IndexMap<String, Scalar>,
    }

    impl RecordView {
        pub fn new(position: usize, rec: &Record, today: NaiveDate, soon_days: i64) -> Self {
            Self {
                position,
                date: rec.date,
                desc: rec.fields.desc.clone(),
                tags: rec
                    .fields
                    .tags
                    .iter()
                    .flatten()
                    .map(|t| t.to_string())
                    .collect(),
                due: rec.fields.due,
                urgency: rec.fields.due.map(|due| classify_due(due, today, soon_days)),
                duration: clock::duration(rec).map(clock::format_duration),
                note_lines: rec
                    .fields
                    .note
                    .as_deref()
                    .map(|n| n.lines().map(str::to_string).collect())
                    .unwrap_or_default(),
                extensions: rec.fields.extensions.clone(),
            }
        }

        /// `+a +b`, empty when untagged.
        pub fn tag_string(&self) -> String {
            self.tags
                .iter()
                .map(|t| format!("+{}", t))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    /* ------------------------------ Printing ------------------------------ */

    mod ansi {
        pub const PLAIN: &str = "\x1b[0m";
        pub const RED: &str = "\x1b[31m";
        pub const GREEN: &str = "\x1b[32m";
        pub const BROWN: &str = "\x1b[33m";
        pub const YELLOW: &str = "\x1b[1;33m";
        pub const MAGENTA: &str = "\x1b[35m";
        pub const CYAN: &str = "\x1b[36m";
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Layout {
        /// `date desc +tags`
        Entry,
        /// `N. desc +tags [due]`
        Todo,
        /// Indented under a day header.
        Calendar,
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct Printer {
        pub color: bool,
    }

    impl Printer {
        pub fn new(color: bool) -> Self {
            Self { color }
        }

        fn paint(&self, code: &str, text: &str) -> String {
            if self.color {
                format!("{}{}{}", code, text, ansi::PLAIN)
            } else {
                text.to_string()
            }
        }

        /// One record. `verbose` adds the clock and note lines.
        pub fn line(&self, view: &RecordView, layout: Layout, verbose: bool) -> String {
            let mut parts = Vec::new();
            match layout {
                Layout::Entry => {
                    let date = view
                        .date
                        .map(|d| d.format(DATE_FORMAT).to_string())
                        .unwrap_or_default();
                    parts.push(self.paint(ansi::CYAN, &date));
                }
                Layout::Todo => parts.push(format!("{}.", view.position)),
                Layout::Calendar => parts.push(" ".to_string()),
            }
            if let Some(desc) = &view.desc {
                parts.push(desc.clone());
            }
            for tag in &view.tags {
                parts.push(self.paint(ansi::YELLOW, &format!("+{}", tag)));
            }
            if let (Some(due), Some(urgency)) = (view.due, view.urgency) {
                if verbose || layout == Layout::Todo {
                    let code = match urgency {
                        Urgency::Overdue => ansi::RED,
                        Urgency::Today => ansi::MAGENTA,
                        Urgency::Soon => ansi::BROWN,
                        Urgency::Later => ansi::GREEN,
                    };
                    parts.push(self.paint(code, &format!("[due {}]", due.format(DATE_FORMAT))));
                }
            }
            if verbose {
                if let Some(d) = &view.duration {
                    parts.push(self.paint(ansi::BROWN, &format!("[{}]", d)));
                }
            }

            let mut out = parts.join(" ");
            if verbose {
                for line in &view.note_lines {
                    out.push_str("\n  ");
                    out.push_str(line);
                }
            }
            out
        }

        /// Day header for calendar listings, with an underline.
        pub fn day_header(&self, date: Option<NaiveDate>) -> String {
            let title = match date {
                Some(d) => d.format("%Y-%m-%d %a").to_string(),
                None => "(undated)".to_string(),
            };
            format!("{}\n{}", self.paint(ansi::CYAN, &title), "-".repeat(14))
        }

        pub fn section(&self, title: &str) -> String {
            format!("{}\n{}", title, "-".repeat(title.chars().count()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::codec;
        use crate::store::RecordPatch;

        fn day(d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2016, 7, d).unwrap()
        }

        fn record(text: &str) -> Record {
            let mut rec = Record::new(None);
            RecordPatch::from(codec::parse(text)).apply_to(&mut rec);
            rec
        }

        #[test]
        fn urgency_classes() {
            let today = day(10);
            assert_eq!(classify_due(day(9), today, 3), Urgency::Overdue);
            assert_eq!(classify_due(day(10), today, 3), Urgency::Today);
            assert_eq!(classify_due(day(13), today, 3), Urgency::Soon);
            assert_eq!(classify_due(day(14), today, 3), Urgency::Later);
        }

        #[test]
        fn view_snapshot() {
            let mut rec = record("2016-07-04 report +work +q3 due:2016-07-05 tclock:90");
            rec.fields.note = Some("line one\nline two".into());
            let view = RecordView::new(2, &rec, day(4), 3);
            assert_eq!(view.tag_string(), "+work +q3");
            assert_eq!(view.urgency, Some(Urgency::Soon));
            assert_eq!(view.duration.as_deref(), Some("1:30:00"));
            assert_eq!(view.note_lines, vec!["line one", "line two"]);
        }

        #[test]
        fn plain_layouts() {
            let printer = Printer::new(false);
            let rec = record("2016-07-04 report +work due:2016-07-01");
            let view = RecordView::new(0, &rec, day(4), 3);
            assert_eq!(
                printer.line(&view, Layout::Entry, false),
                "2016-07-04 report +work"
            );
            assert_eq!(
                printer.line(&view, Layout::Todo, false),
                "0. report +work [due 2016-07-01]"
            );
            assert_eq!(printer.line(&view, Layout::Calendar, false), "  report +work");
        }

        #[test]
        fn verbose_adds_clock_and_notes() {
            let printer = Printer::new(false);
            let mut rec = record("2016-07-04 call tclock:5");
            rec.fields.note = Some("left voicemail".into());
            let view = RecordView::new(0, &rec, day(4), 3);
            assert_eq!(
                printer.line(&view, Layout::Entry, true),
                "2016-07-04 call [0:05:00]\n  left voicemail"
            );
        }

        #[test]
        fn color_wraps_segments() {
            let printer = Printer::new(true);
            let view = RecordView::new(0, &record("2016-07-04 x +t"), day(4), 3);
            let line = printer.line(&view, Layout::Entry, false);
            assert!(line.starts_with("\x1b[36m2016-07-04\x1b[0m"));
            assert!(line.contains("\x1b[1;33m+t\x1b[0m"));
            assert_eq!(
                Printer::new(false).day_header(Some(day(4))),
                "2016-07-04 Mon\n--------------"
            );
        }
    }
}

pub mod storage {
    //! Whole-document persistence. The file is read once at start and rewritten once at the end.

    use crate::core::{LedgerDocument, Record};
    use anyhow::{Context, Result};
    use std::{
        fs,
        io::ErrorKind,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub trait DocumentStore {
        /// Missing storage yields an empty document.
        fn load(&self) -> Result<LedgerDocument>;

        fn save(&self, doc: &LedgerDocument) -> Result<()>;
    }

    /// YAML mapping of `log`, `todo`, `scheduled`, `tics` and `catch`.
    #[derive(Debug, Clone)]
    pub struct YamlFileStore {
        path: PathBuf,
    }

    impl YamlFileStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl DocumentStore for YamlFileStore {
        fn load(&self) -> Result<LedgerDocument> {
            let text = match fs::read_to_string(&self.path) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = ?self.path, "ledger file missing; starting empty");
                    return Ok(LedgerDocument::default());
                }
                Err(e) => return Err(e).with_context(|| format!("reading {:?}", self.path)),
            };
            let doc = from_yaml_str(&text).with_context(|| format!("parsing {:?}", self.path))?;
            debug!(
                path = ?self.path,
                log = doc.log.len(),
                todo = doc.todo.len(),
                scheduled = doc.scheduled.len(),
                "ledger loaded"
            );
            Ok(doc)
        }

        fn save(&self, doc: &LedgerDocument) -> Result<()> {
            let text = to_yaml_string(doc)?;
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            fs::write(&self.path, text).with_context(|| format!("writing {:?}", self.path))?;
            debug!(path = ?self.path, "ledger saved");
            Ok(())
        }
    }

    /// Also accepts an older layout whose root is a bare list of log records.
    pub fn from_yaml_str(text: &str) -> Result<LedgerDocument> {
        let value: serde_yaml::Value = serde_yaml::from_str(text).context("invalid YAML")?;
        match value {
            serde_yaml::Value::Null => Ok(LedgerDocument::default()),
            serde_yaml::Value::Sequence(_) => {
                let log: Vec<Record> =
                    serde_yaml::from_value(value).context("reading bare record list")?;
                Ok(LedgerDocument {
                    log,
                    ..Default::default()
                })
            }
            other => serde_yaml::from_value(other).context("reading ledger document"),
        }
    }

    /// Multi-line strings come out as block literals.
    pub fn to_yaml_string(doc: &LedgerDocument) -> Result<String> {
        serde_yaml::to_string(doc).context("serializing ledger document")
    }

}

pub mod config {
    //! User configuration read from a YAML file; every key is optional.

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        io::ErrorKind,
        path::{Path, PathBuf},
    };

    pub const DEFAULT_CONFIG_PATH: &str = "~/.tasklog.yml";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// Ledger document; `~` expands to `$HOME`.
        pub file: PathBuf,
        pub color: bool,
        /// Log entries shown by `view`.
        pub recent: usize,
        /// Days ahead that count as "due soon".
        pub due_soon_days: i64,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                file: PathBuf::from("~/tasklog.yml"),
                color: true,
                recent: 5,
                due_soon_days: 3,
            }
        }
    }

    impl Config {
        pub fn load(path: &Path) -> Result<Self> {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
                Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
            };
            if text.trim().is_empty() {
                return Ok(Self::default());
            }
            serde_yaml::from_str(&text).with_context(|| format!("parsing config {:?}", path))
        }

        pub fn ledger_path(&self) -> PathBuf {
            expand_home(&self.file)
        }
    }

    pub fn expand_home(path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        path.to_path_buf()
    }

}

pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Installs a stderr subscriber. `RUST_LOG` wins over the `verbose` switch.
    pub fn init(verbose: bool) {
        let level = if verbose { "debug" } else { "warn" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact();
        // a second init (tests, embedding) is a no-op
        let _ = subscriber.try_init();
    }
}

pub use crate::codec::{Parsed, parse, render};
pub use crate::core::{LedgerDocument, LedgerError, Record, RecordId, ScheduleRule, Scalar, Tag};
pub use crate::ledger::{Added, ClockInput, Ledger};
pub use crate::storage::{DocumentStore, YamlFileStore};
pub use crate::store::{RecordPatch, RecordStore};
