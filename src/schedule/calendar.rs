//! Service calendars and day types.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Schedule calendar category used to bucket historical statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Weekday,
    Saturday,
    SundayHoliday,
}

impl DayType {
    pub fn for_date(date: NaiveDate, holidays: &HashSet<NaiveDate>) -> Self {
        if holidays.contains(&date) {
            return DayType::SundayHoliday;
        }
        match date.weekday() {
            Weekday::Sat => DayType::Saturday,
            Weekday::Sun => DayType::SundayHoliday,
            _ => DayType::Weekday,
        }
    }
}

impl fmt::Display for DayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DayType::Weekday => "weekday",
            DayType::Saturday => "saturday",
            DayType::SundayHoliday => "sunday_holiday",
        };
        f.write_str(s)
    }
}

/// One service pattern: the weekdays it runs within a date range, plus
/// explicit exceptions.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    /// Monday first.
    pub weekdays: [bool; 7],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub added_dates: HashSet<NaiveDate>,
    pub removed_dates: HashSet<NaiveDate>,
}

impl Service {
    pub fn is_active(&self, date: NaiveDate) -> bool {
        if self.removed_dates.contains(&date) {
            return false;
        }
        if self.added_dates.contains(&date) {
            return true;
        }
        date >= self.start_date
            && date <= self.end_date
            && self.weekdays[date.weekday().num_days_from_monday() as usize]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCalendar {
    services: HashMap<String, Service>,
    holidays: HashSet<NaiveDate>,
}

impl ServiceCalendar {
    pub fn add_service(&mut self, service: Service) {
        self.services.insert(service.id.clone(), service);
    }

    pub fn add_holiday(&mut self, date: NaiveDate) {
        self.holidays.insert(date);
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }

    pub fn is_active(&self, service_id: &str, date: NaiveDate) -> bool {
        self.services
            .get(service_id)
            .is_some_and(|s| s.is_active(date))
    }

    pub fn day_type(&self, date: NaiveDate) -> DayType {
        DayType::for_date(date, &self.holidays)
    }
}
