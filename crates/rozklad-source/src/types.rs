//! Records as delivered by the upstream source.

use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize};

/// A faculty as listed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacultyRecord {
    #[serde(deserialize_with = "int_or_string")]
    pub id: i64,
    pub name: String,
}

/// A group as listed upstream for one faculty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    /// Filled from the request, the upstream listing does not repeat it.
    pub faculty_id: i64,
}

/// A teacher as listed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherRecord {
    #[serde(deserialize_with = "int_or_string")]
    pub id: i64,
    pub name: String,
}

/// One lesson of a group's two-week timetable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRecord {
    /// Period number within the day.
    #[serde(deserialize_with = "int_or_string")]
    pub num: i64,
    /// Room.
    #[serde(default)]
    pub auditory: String,
    /// Lesson kind (lecture, lab, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Subgroup number, 0 when the whole group attends.
    #[serde(default, deserialize_with = "int_or_string")]
    pub subgroup: i64,
    /// Subject name.
    #[serde(rename = "name")]
    pub subject: String,
    #[serde(deserialize_with = "int_or_string")]
    pub teacher_id: i64,
    #[serde(with = "hhmm")]
    pub begin: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Day-of-week label (`Пн` .. `Нд`).
    pub dow: String,
    /// Week parity, 1 or 2.
    #[serde(deserialize_with = "int_or_string")]
    pub week_num: i64,
}

/// Upstream ids and counters arrive as numbers or numeric strings.
pub(crate) fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(d)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(serde::de::Error::custom)
    }
}
