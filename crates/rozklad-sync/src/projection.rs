//! Read projections served to clients, cached by key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use rozklad_store::{Lesson, Storage};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::invalidate::{FACULTIES_KEY, timetable_key};
use crate::{CacheInvalidator, SyncError};

/// Day labels in timetable order, Monday first.
pub const DAYS: [&str; 7] = ["Пн", "Вт", "Ср", "Чт", "Пт", "Сб", "Нд"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupListing {
    pub id: i64,
    pub name: String,
}

/// A faculty with its groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacultyListing {
    pub id: i64,
    pub name: String,
    pub groups: Vec<GroupListing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherRef {
    pub id: i64,
    pub name: String,
}

/// One lesson as shown in a timetable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonView {
    /// `DD.MM` of the day this lesson falls on.
    pub date: String,
    pub num: i64,
    pub auditory: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub subgroup: i64,
    pub name: String,
    pub teacher: TeacherRef,
    pub begin: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub day: String,
    pub lessons: Vec<LessonView>,
}

/// A group's two-week timetable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timetable {
    pub first_week: Vec<DaySchedule>,
    pub second_week: Vec<DaySchedule>,
}

/// `DD.MM` labels for the days of the first and second timetable week.
///
/// The first week is the current ISO week when its number is even,
/// otherwise the next one.
pub fn week_dates(today: NaiveDate) -> [[String; 7]; 2] {
    let this_monday = today - ChronoDuration::days(today.weekday().num_days_from_monday() as i64);
    let next_monday = this_monday + ChronoDuration::days(7);
    let label = |monday: NaiveDate| -> [String; 7] {
        std::array::from_fn(|i| {
            (monday + ChronoDuration::days(i as i64))
                .format("%d.%m")
                .to_string()
        })
    };

    if today.iso_week().week() % 2 == 0 {
        [label(this_monday), label(next_monday)]
    } else {
        [label(next_monday), label(this_monday)]
    }
}

/// All faculties with their groups. Stale entities are left out.
/// Time left until the next Monday 00:00, when the week labels move on.
pub fn until_week_rollover(now: NaiveDateTime) -> Duration {
    let days_left = 7 - now.weekday().num_days_from_monday() as i64;
    let next_monday = (now.date() + ChronoDuration::days(days_left)).and_time(NaiveTime::MIN);
    (next_monday - now).to_std().unwrap_or(Duration::ZERO)
}

pub async fn faculties_with_groups(
    storage: &dyn Storage,
) -> Result<Vec<FacultyListing>, SyncError> {
    let mut by_faculty: HashMap<i64, Vec<GroupListing>> = HashMap::new();
    for group in storage.groups().await? {
        if !group.stale {
            by_faculty.entry(group.faculty_id).or_default().push(GroupListing {
                id: group.id,
                name: group.name,
            });
        }
    }

    Ok(storage
        .faculties()
        .await?
        .into_iter()
        .filter(|f| !f.stale)
        .map(|f| FacultyListing {
            groups: by_faculty.remove(&f.id).unwrap_or_default(),
            id: f.id,
            name: f.name,
        })
        .collect())
}

/// The timetable of one group, or `None` if the group is unknown.
pub async fn group_timetable(
    storage: &dyn Storage,
    group_id: i64,
    today: NaiveDate,
) -> Result<Option<Timetable>, SyncError> {
    if storage.group(group_id).await?.is_none() {
        return Ok(None);
    }

    let teachers: HashMap<i64, String> = storage
        .teachers()
        .await?
        .into_iter()
        .map(|t| (t.id, t.name))
        .collect();
    let [first_dates, second_dates] = week_dates(today);

    let empty_week = || -> Vec<DaySchedule> {
        DAYS.iter()
            .map(|day| DaySchedule {
                day: day.to_string(),
                lessons: Vec::new(),
            })
            .collect()
    };
    let mut timetable = Timetable {
        first_week: empty_week(),
        second_week: empty_week(),
    };

    for lesson in storage.lessons_of_group(group_id).await? {
        let Some(day) = DAYS.iter().position(|d| *d == lesson.content.dow) else {
            warn!(group_id, dow = %lesson.content.dow, "lesson with unknown day label");
            continue;
        };
        let (week, dates) = if lesson.content.week_num == 1 {
            (&mut timetable.first_week, &first_dates)
        } else {
            (&mut timetable.second_week, &second_dates)
        };
        let view = lesson_view(lesson, dates[day].clone(), &teachers);
        week[day].lessons.push(view);
    }

    for day in timetable
        .first_week
        .iter_mut()
        .chain(timetable.second_week.iter_mut())
    {
        day.lessons.sort_by(|a, b| (a.num, a.subgroup).cmp(&(b.num, b.subgroup)));
    }

    Ok(Some(timetable))
}

fn lesson_view(lesson: Lesson, date: String, teachers: &HashMap<i64, String>) -> LessonView {
    let c = lesson.content;
    LessonView {
        date,
        num: c.num,
        auditory: c.auditory,
        kind: c.kind,
        subgroup: c.subgroup,
        name: c.subject,
        teacher: TeacherRef {
            id: c.teacher_id,
            name: teachers.get(&c.teacher_id).cloned().unwrap_or_default(),
        },
        begin: c.begin.format("%H:%M").to_string(),
        end: c.end.format("%H:%M").to_string(),
    }
}

/// Cached, serialized projections.
#[derive(Clone)]
pub struct Projections {
    storage: Arc<dyn Storage>,
    invalidator: CacheInvalidator,
    ttl: Duration,
}

impl Projections {
    pub fn new(storage: Arc<dyn Storage>, invalidator: CacheInvalidator, ttl: Duration) -> Self {
        Self {
            storage,
            invalidator,
            ttl,
        }
    }

    /// JSON array of [`FacultyListing`].
    pub async fn faculties_json(&self) -> Result<String, SyncError> {
        self.invalidator
            .get_or_fill(FACULTIES_KEY, self.ttl, || async {
                let listing = faculties_with_groups(self.storage.as_ref()).await?;
                to_json(&listing)
            })
            .await
    }

    /// JSON [`Timetable`] of a group, `None` for an unknown group.
    pub async fn timetable_json(&self, group_id: i64) -> Result<Option<String>, SyncError> {
        if self.storage.group(group_id).await?.is_none() {
            return Ok(None);
        }

        // Dates are baked into the payload, so it must not outlive the week
        let now = Local::now().naive_local();
        let ttl = self.ttl.min(until_week_rollover(now));

        let key = timetable_key(group_id);
        let payload = self
            .invalidator
            .get_or_fill(&key, ttl, || async {
                match group_timetable(self.storage.as_ref(), group_id, now.date()).await? {
                    Some(timetable) => to_json(&timetable),
                    None => Err(SyncError::MissingDependency {
                        kind: rozklad_store::EntityKind::Group,
                        id: group_id,
                    }),
                }
            })
            .await?;
        Ok(Some(payload))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    serde_json::to_string(value).map_err(|e| SyncError::PipelineFailed(format!("encode projection: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use pretty_assertions::assert_eq;
    use rozklad_store::{CacheStore, EntityKind, LessonContent, MemoryCache, SqliteStore, WriteOp};
    use test_case::test_case;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn content(num: i64, dow: &str, week_num: i64) -> LessonContent {
        LessonContent {
            group_id: 10,
            teacher_id: 7,
            num,
            auditory: "1-101".into(),
            kind: "Лаб".into(),
            subgroup: 0,
            subject: "Algebra".into(),
            begin: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            end: NaiveTime::from_hms_opt(9, 50, 0).unwrap(),
            dow: dow.into(),
            week_num,
        }
    }

    async fn store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .apply(vec![
                WriteOp::PutFaculty { id: 1, name: "Engineering".into() },
                WriteOp::PutFaculty { id: 2, name: "Closed".into() },
                WriteOp::PutGroup { id: 10, name: "CS-101".into(), faculty_id: 1 },
                WriteOp::PutGroup { id: 11, name: "CS-old".into(), faculty_id: 1 },
                WriteOp::PutTeacher { id: 7, name: "A. Ivanov".into() },
                WriteOp::MarkStale { kind: EntityKind::Faculty, id: 2 },
                WriteOp::MarkStale { kind: EntityKind::Group, id: 11 },
                WriteOp::InsertLesson { id: Uuid::new_v4(), content: content(2, "Пн", 1) },
                WriteOp::InsertLesson { id: Uuid::new_v4(), content: content(1, "Пн", 1) },
                WriteOp::InsertLesson { id: Uuid::new_v4(), content: content(3, "Ср", 2) },
            ])
            .await
            .unwrap();
        store
    }

    // 2026-10-19 is Monday of ISO week 43, 2026-10-26 of week 44
    #[test_case(date(2026, 10, 21), "26.10", "19.10" ; "odd week starts with next")]
    #[test_case(date(2026, 10, 28), "26.10", "02.11" ; "even week starts with current")]
    #[test_case(date(2026, 11, 1), "26.10", "02.11" ; "sunday belongs to its week")]
    fn test_week_dates(today: NaiveDate, first_monday: &str, second_monday: &str) {
        let [first, second] = week_dates(today);
        assert_eq!(first[0], first_monday);
        assert_eq!(second[0], second_monday);
    }

    #[test_case(date(2026, 10, 25).and_hms_opt(23, 0, 0).unwrap(), 3600 ; "late sunday")]
    #[test_case(date(2026, 10, 26).and_hms_opt(0, 0, 0).unwrap(), 7 * 86_400 ; "monday midnight")]
    #[test_case(date(2026, 10, 28).and_hms_opt(12, 0, 0).unwrap(), 4 * 86_400 + 12 * 3600 ; "midweek")]
    fn test_until_week_rollover(now: NaiveDateTime, secs: u64) {
        assert_eq!(until_week_rollover(now), Duration::from_secs(secs));
    }

    #[tokio::test]
    async fn test_timetable_expires_with_its_week() {
        let store = store().await;
        let cache = Arc::new(MemoryCache::new());
        let invalidator = CacheInvalidator::new(cache.clone(), store.clone());
        let month = Duration::from_secs(30 * 86_400);
        let projections = Projections::new(store.clone(), invalidator, month);

        projections.timetable_json(10).await.unwrap().unwrap();
        let ttl = cache.ttl(&timetable_key(10)).await.unwrap();
        assert!(ttl <= Duration::from_secs(7 * 86_400), "{ttl:?}");

        // Listings carry no dates and keep the configured lifetime
        projections.faculties_json().await.unwrap();
        assert!(cache.ttl(FACULTIES_KEY).await.unwrap() > Duration::from_secs(7 * 86_400));
    }

    #[tokio::test]
    async fn test_faculties_listing_omits_stale() {
        let store = store().await;
        let listing = faculties_with_groups(store.as_ref()).await.unwrap();
        assert_eq!(
            listing,
            vec![FacultyListing {
                id: 1,
                name: "Engineering".into(),
                groups: vec![GroupListing { id: 10, name: "CS-101".into() }],
            }]
        );
    }

    #[tokio::test]
    async fn test_timetable_layout() {
        let store = store().await;
        let timetable = group_timetable(store.as_ref(), 10, date(2026, 10, 28))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(timetable.first_week.len(), 7);
        assert_eq!(timetable.first_week[0].day, "Пн");
        let monday: Vec<i64> = timetable.first_week[0].lessons.iter().map(|l| l.num).collect();
        assert_eq!(monday, vec![1, 2]);
        assert_eq!(timetable.first_week[0].lessons[0].date, "26.10");
        assert_eq!(timetable.first_week[0].lessons[0].teacher.name, "A. Ivanov");
        assert_eq!(timetable.first_week[0].lessons[0].begin, "08:30");

        let wednesday = &timetable.second_week[2].lessons;
        assert_eq!(wednesday.len(), 1);
        assert_eq!(wednesday[0].date, "04.11");
    }

    #[tokio::test]
    async fn test_timetable_json_shape() {
        let store = store().await;
        let timetable = group_timetable(store.as_ref(), 10, date(2026, 10, 28))
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&timetable).unwrap();
        assert!(json.get("firstWeek").is_some());
        assert_eq!(json["firstWeek"][0]["lessons"][0]["type"], "Лаб");
        assert_eq!(json["firstWeek"][0]["lessons"][0]["name"], "Algebra");
    }

    #[tokio::test]
    async fn test_unknown_group_has_no_timetable() {
        let store = store().await;
        assert!(group_timetable(store.as_ref(), 404, date(2026, 10, 28))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_projections_cache_until_invalidated() {
        let store = store().await;
        let cache = Arc::new(MemoryCache::new());
        let invalidator = CacheInvalidator::new(cache.clone(), store.clone());
        let projections = Projections::new(store.clone(), invalidator.clone(), Duration::from_secs(3600));

        let before = projections.faculties_json().await.unwrap();
        store
            .apply(vec![WriteOp::PutGroup { id: 12, name: "CS-103".into(), faculty_id: 1 }])
            .await
            .unwrap();
        // Still served from cache
        assert_eq!(projections.faculties_json().await.unwrap(), before);

        invalidator.invalidate(&[FACULTIES_KEY.to_string()]).await;
        assert!(projections.faculties_json().await.unwrap().contains("CS-103"));

        assert!(projections.timetable_json(404).await.unwrap().is_none());
        assert!(projections.timetable_json(10).await.unwrap().is_some());
        assert!(cache.get(&timetable_key(10)).await.is_some());
    }
}
