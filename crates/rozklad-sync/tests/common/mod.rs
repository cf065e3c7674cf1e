//! Shared fixtures: a scripted upstream source and a wired-up orchestrator.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use rozklad_scheduler::Scheduler;
use rozklad_source::{
    FacultyRecord, GroupRecord, LessonRecord, ScheduleSource, SourceError, TeacherRecord,
};
use rozklad_store::{MemoryCache, SqliteStore};
use rozklad_sync::{
    CacheInvalidator, Orchestrator, Projections, Reconciler, RefreshPipeline, StalePolicy,
};

#[derive(Default)]
struct Script {
    faculties: Vec<FacultyRecord>,
    groups: HashMap<i64, Vec<GroupRecord>>,
    teachers: Vec<TeacherRecord>,
    lessons: HashMap<i64, Vec<LessonRecord>>,
    failing: HashSet<String>,
    calls: Vec<String>,
    /// Delay before answering a call, by call name.
    delays: HashMap<String, Duration>,
}

/// Upstream source answering from a script. Every call is logged by name:
/// `faculties`, `groups:<faculty>`, `teachers`, `lessons:<group>`.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<Script>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faculties(&self, faculties: Vec<FacultyRecord>) {
        self.script.lock().unwrap().faculties = faculties;
    }

    pub fn set_groups(&self, faculty_id: i64, groups: Vec<GroupRecord>) {
        self.script.lock().unwrap().groups.insert(faculty_id, groups);
    }

    pub fn set_teachers(&self, teachers: Vec<TeacherRecord>) {
        self.script.lock().unwrap().teachers = teachers;
    }

    pub fn set_lessons(&self, group_id: i64, lessons: Vec<LessonRecord>) {
        self.script.lock().unwrap().lessons.insert(group_id, lessons);
    }

    /// Make a call fail with `Unavailable` until healed.
    pub fn fail(&self, call: &str) {
        self.script.lock().unwrap().failing.insert(call.to_string());
    }

    pub fn heal(&self, call: &str) {
        self.script.lock().unwrap().failing.remove(call);
    }

    pub fn delay(&self, call: &str, by: Duration) {
        self.script
            .lock()
            .unwrap()
            .delays
            .insert(call.to_string(), by);
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.script.lock().unwrap().calls.clear();
    }

    async fn enter(&self, call: String) -> Result<(), SourceError> {
        let (failing, delay) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call.clone());
            (
                script.failing.contains(&call),
                script.delays.get(&call).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(SourceError::Unavailable(format!("{} is down", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleSource for ScriptedSource {
    async fn fetch_faculties(&self) -> Result<Vec<FacultyRecord>, SourceError> {
        self.enter("faculties".to_string()).await?;
        Ok(self.script.lock().unwrap().faculties.clone())
    }

    async fn fetch_groups(&self, faculty_id: i64) -> Result<Vec<GroupRecord>, SourceError> {
        self.enter(format!("groups:{}", faculty_id)).await?;
        Ok(self
            .script
            .lock()
            .unwrap()
            .groups
            .get(&faculty_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_teachers(&self) -> Result<Vec<TeacherRecord>, SourceError> {
        self.enter("teachers".to_string()).await?;
        Ok(self.script.lock().unwrap().teachers.clone())
    }

    async fn fetch_group_lessons(&self, group_id: i64) -> Result<Vec<LessonRecord>, SourceError> {
        self.enter(format!("lessons:{}", group_id)).await?;
        Ok(self
            .script
            .lock()
            .unwrap()
            .lessons
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn faculty(id: i64, name: &str) -> FacultyRecord {
    FacultyRecord {
        id,
        name: name.to_string(),
    }
}

pub fn group(id: i64, name: &str, faculty_id: i64) -> GroupRecord {
    GroupRecord {
        id,
        name: name.to_string(),
        faculty_id,
    }
}

pub fn teacher(id: i64, name: &str) -> TeacherRecord {
    TeacherRecord {
        id,
        name: name.to_string(),
    }
}

pub fn lesson(num: i64, teacher_id: i64, subject: &str, dow: &str) -> LessonRecord {
    LessonRecord {
        num,
        auditory: "2-204".to_string(),
        kind: "Лек".to_string(),
        subgroup: 0,
        subject: subject.to_string(),
        teacher_id,
        begin: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
        end: NaiveTime::from_hms_opt(9, 50, 0).unwrap(),
        dow: dow.to_string(),
        week_num: 1,
    }
}

/// Everything a scenario needs, wired the way the daemon wires it.
pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub store: Arc<SqliteStore>,
    pub cache: Arc<MemoryCache>,
    pub scheduler: Scheduler,
    pub orchestrator: Arc<Orchestrator>,
    pub projections: Projections,
}

impl Harness {
    pub fn new(policy: StalePolicy) -> Self {
        let source = Arc::new(ScriptedSource::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(MemoryCache::new());
        let scheduler = Scheduler::new();

        let invalidator = CacheInvalidator::new(cache.clone(), store.clone());
        let reconciler = Reconciler::new(store.clone(), policy);
        let pipeline = RefreshPipeline::new(source.clone(), store.clone(), reconciler)
            .with_lesson_concurrency(2);
        let orchestrator = Arc::new(
            Orchestrator::new(pipeline, invalidator.clone(), store.clone())
                .with_scheduler(scheduler.clone()),
        );
        let projections = Projections::new(store.clone(), invalidator, Duration::from_secs(3600));

        Self {
            source,
            store,
            cache,
            scheduler,
            orchestrator,
            projections,
        }
    }

    /// Engineering with CS-101 and CS-102, one teacher, one lesson each.
    pub fn script_engineering(&self) {
        self.source.set_faculties(vec![faculty(1, "Engineering")]);
        self.source.set_groups(
            1,
            vec![group(10, "CS-101", 1), group(11, "CS-102", 1)],
        );
        self.source.set_teachers(vec![teacher(7, "A. Ivanov")]);
        self.source
            .set_lessons(10, vec![lesson(1, 7, "Algebra", "Пн")]);
        self.source
            .set_lessons(11, vec![lesson(2, 7, "Geometry", "Вт")]);
    }
}
