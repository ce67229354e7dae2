//! Course lookup against the public timetable.
//!
//! The timetable is served per department as an HTML table. Finding a CRN
//! means fetching departments until one lists it, so department pages are
//! cached with a TTL and a bounded LRU, and the departments most students
//! take courses from are searched first.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::LookupConfig;
use crate::traits::CourseCatalog;
use crate::tracker::CourseCode;

/// Searched before the rest of the department list, in this order.
pub const POPULAR_DEPARTMENTS: &[&str] = &[
    "MAT", "FIZ", "KIM", "BLG", "EHB", "ELK", "INS", "MAK", "END", "UCK", "GEM", "DEN", "CEV",
    "GID", "JEF", "MET", "KMM", "IBM", "IML", "BIO", "HTA", "TEK", "ISL", "KOM", "MAD", "GEO",
    "AKM", "TUR", "ING", "BED", "EUT", "MIM", "PEM", "SBP", "ICM", "MTO", "JEO", "CHZ", "ROS",
    "UZB",
];

const DAY_LABELS: [&str; 5] = ["Pzt", "Sal", "Çar", "Per", "Cum"];

// Rows shorter than this are headers or notes.
const MIN_COLUMNS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    #[serde(rename = "dersBransKodu")]
    pub code: String,
    #[serde(rename = "bransKoduId")]
    pub id: u32,
}

/// One weekly meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSession {
    /// 0 = Monday .. 4 = Friday
    pub day: u8,
    pub start_time: String,
    pub end_time: String,
    pub room: String,
    pub building: String,
}

impl CourseSession {
    pub fn day_label(&self) -> &'static str {
        DAY_LABELS.get(usize::from(self.day)).copied().unwrap_or("?")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseInfo {
    pub crn: String,
    pub course_code: String,
    pub course_name: String,
    pub instructor: String,
    pub teaching_method: String,
    pub capacity: u32,
    pub enrolled: u32,
    pub sessions: Vec<CourseSession>,
    pub programmes: String,
}

impl CourseInfo {
    pub fn seats_left(&self) -> u32 {
        self.capacity.saturating_sub(self.enrolled)
    }

    pub fn is_full(&self) -> bool {
        self.seats_left() == 0
    }
}

/// Weekday index for the names the timetable uses, English or Turkish.
pub fn day_index(name: &str) -> Option<u8> {
    Some(match name {
        "Monday" | "Mon" | "Pazartesi" | "Pzt" => 0,
        "Tuesday" | "Tue" | "Salı" | "Sal" => 1,
        "Wednesday" | "Wed" | "Çarşamba" | "Çar" => 2,
        "Thursday" | "Thu" | "Perşembe" | "Per" => 3,
        "Friday" | "Fri" | "Cuma" | "Cum" => 4,
        _ => return None,
    })
}

fn selector(css: &'static str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {:?}: {:?}", css, e))
}

/// Courses listed in a department timetable page.
///
/// Columns are located relative to the first cell holding a 5-digit CRN, so
/// leading columns the page may add are skipped. Rows that do not fit are
/// dropped.
pub fn parse_courses_html(html: &str) -> Result<Vec<CourseInfo>> {
    let document = Html::parse_document(html);
    let (table, row, cell) = (selector("table")?, selector("tr")?, selector("td")?);
    let times = Regex::new(r"(\d{2}:\d{2})/(\d{2}:\d{2})")?;

    let Some(table) = document.select(&table).next() else {
        warn!("[LOOKUP] No table in timetable page");
        return Ok(Vec::new());
    };

    let mut courses = Vec::new();
    for tr in table.select(&row) {
        let texts: Vec<String> = tr
            .select(&cell)
            .map(|td| td.text().map(str::trim).collect::<String>())
            .collect();
        if texts.len() < MIN_COLUMNS {
            continue;
        }
        let Some(at) = texts.iter().position(|t| t.parse::<CourseCode>().is_ok()) else {
            continue;
        };

        let col = |offset: usize| texts.get(at + offset).map(String::as_str).unwrap_or("");
        let count = |offset: usize| col(offset).parse::<u32>().unwrap_or(0);
        let programmes = texts
            .iter()
            .skip(at + 11)
            .take(4)
            .find(|t| t.contains("_LS") || t.contains("_YD"))
            .cloned()
            .unwrap_or_default();

        courses.push(CourseInfo {
            crn: col(0).to_string(),
            course_code: col(1).to_string(),
            course_name: col(2).to_string(),
            teaching_method: col(3).to_string(),
            instructor: col(4).to_string(),
            sessions: parse_sessions(col(6), col(7), col(8), col(5), &times),
            capacity: count(9),
            enrolled: count(10),
            programmes,
        });
    }
    Ok(courses)
}

/// Zips the space-separated day, room and building columns with the
/// `HH:MM/HH:MM` ranges. A day without a time range is dropped.
fn parse_sessions(days: &str, times: &str, rooms: &str, buildings: &str, pattern: &Regex) -> Vec<CourseSession> {
    let ranges: Vec<(String, String)> = pattern
        .captures_iter(times)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    let rooms: Vec<&str> = rooms.split_whitespace().collect();
    let buildings: Vec<&str> = buildings.split_whitespace().collect();

    days.split_whitespace()
        .enumerate()
        .filter_map(|(i, name)| {
            let day = day_index(name)?;
            let (start_time, end_time) = ranges.get(i)?.clone();
            Some(CourseSession {
                day,
                start_time,
                end_time,
                room: rooms.get(i).unwrap_or(&"--").to_string(),
                building: buildings.get(i).unwrap_or(&"--").to_string(),
            })
        })
        .collect()
}

struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

impl<V> Cached<V> {
    fn new(value: V) -> Self {
        Cached {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// CRN lookup over a [`CourseCatalog`], caching department pages.
///
/// A page that fails to refresh keeps serving its last copy.
pub struct CourseLookup<C> {
    catalog: Arc<C>,
    ttl: Duration,
    max_departments: usize,
    departments: Option<Cached<Vec<Department>>>,
    pages: HashMap<u32, Cached<Vec<CourseInfo>>>,
    recency: VecDeque<u32>, // least recently used at the front
    index: HashMap<String, u32>,
}

impl<C: CourseCatalog> CourseLookup<C> {
    pub fn new(catalog: Arc<C>, config: &LookupConfig) -> Self {
        CourseLookup {
            catalog,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            max_departments: config.max_cached_departments.max(1),
            departments: None,
            pages: HashMap::new(),
            recency: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    pub fn cached_departments(&self) -> usize {
        self.pages.len()
    }

    /// Look up several codes at once, sharing department fetches. Results
    /// follow the order of `codes`; `None` when no department lists the code.
    pub async fn lookup(&mut self, codes: &[CourseCode]) -> Vec<(CourseCode, Option<CourseInfo>)> {
        let mut found: HashMap<String, CourseInfo> = HashMap::new();
        let mut remaining: BTreeSet<String> = BTreeSet::new();
        for code in codes {
            match self.fresh_hit(code.as_str()) {
                Some(info) => {
                    found.insert(code.to_string(), info.clone());
                }
                None => {
                    remaining.insert(code.to_string());
                }
            }
        }

        if !remaining.is_empty() {
            let order = self.search_order(&remaining).await;
            for id in order {
                if remaining.is_empty() {
                    break;
                }
                self.load_department(id).await;
                if let Some(page) = self.pages.get(&id) {
                    for course in &page.value {
                        if remaining.remove(&course.crn) {
                            found.insert(course.crn.clone(), course.clone());
                        }
                    }
                }
            }
            if !remaining.is_empty() {
                let missing: Vec<&str> = remaining.iter().map(String::as_str).collect();
                warn!("[LOOKUP] Not listed in any department: {}", missing.join(", "));
            }
        }

        codes
            .iter()
            .map(|code| (code.clone(), found.get(code.as_str()).cloned()))
            .collect()
    }

    pub async fn lookup_one(&mut self, code: &CourseCode) -> Option<CourseInfo> {
        self.lookup(std::slice::from_ref(code))
            .await
            .into_iter()
            .next()
            .and_then(|(_, info)| info)
    }

    fn fresh_hit(&self, crn: &str) -> Option<&CourseInfo> {
        let page = self.pages.get(self.index.get(crn)?)?;
        if !page.is_fresh(self.ttl) {
            return None;
        }
        page.value.iter().find(|c| c.crn == crn)
    }

    /// Departments that listed a wanted code before, then the popular ones,
    /// then everything else.
    async fn search_order(&mut self, remaining: &BTreeSet<String>) -> Vec<u32> {
        let departments = self.departments().await;
        let by_code: HashMap<&str, u32> = departments.iter().map(|d| (d.code.as_str(), d.id)).collect();

        let known = remaining.iter().filter_map(|crn| self.index.get(crn).copied());
        let popular = POPULAR_DEPARTMENTS.iter().filter_map(|code| by_code.get(code).copied());
        let rest = departments.iter().map(|d| d.id);

        let mut seen = HashSet::new();
        known
            .chain(popular)
            .chain(rest)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    async fn departments(&mut self) -> Vec<Department> {
        if let Some(cached) = &self.departments {
            if cached.is_fresh(self.ttl) {
                return cached.value.clone();
            }
        }
        match self.catalog.departments().await {
            Ok(list) => {
                info!("[LOOKUP] Fetched {} departments", list.len());
                self.departments = Some(Cached::new(list.clone()));
                list
            }
            Err(e) => {
                error!("[LOOKUP] Department list unavailable: {:#}", e);
                self.departments
                    .as_ref()
                    .map(|c| c.value.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn load_department(&mut self, id: u32) {
        if self.pages.get(&id).map_or(false, |p| p.is_fresh(self.ttl)) {
            self.touch(id);
            return;
        }
        match self.catalog.courses(id).await {
            Ok(courses) => {
                debug!("[LOOKUP] Cached {} course(s) for department {}", courses.len(), id);
                for course in &courses {
                    self.index.insert(course.crn.clone(), id);
                }
                self.pages.insert(id, Cached::new(courses));
                self.touch(id);
                self.evict();
            }
            Err(e) if self.pages.contains_key(&id) => {
                warn!("[LOOKUP] Department {} refresh failed, using cached copy: {:#}", id, e);
            }
            Err(e) => warn!("[LOOKUP] Department {} fetch failed: {:#}", id, e),
        }
    }

    fn touch(&mut self, id: u32) {
        self.recency.retain(|d| *d != id);
        self.recency.push_back(id);
    }

    fn evict(&mut self) {
        while self.pages.len() > self.max_departments {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.pages.remove(&oldest);
            self.index.retain(|_, d| *d != oldest);
            debug!("[LOOKUP] Evicted department {}", oldest);
        }
    }
}
