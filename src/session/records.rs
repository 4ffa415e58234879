//! Registry query types.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

/// Which registry the query searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    #[default]
    Domain,
    App,
    MiniProgram,
    FastApp,
}

impl SearchType {
    /// `serviceType` value sent to the API.
    pub fn code(self) -> u8 {
        match self {
            SearchType::Domain => 1,
            SearchType::App => 6,
            SearchType::MiniProgram => 7,
            SearchType::FastApp => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SearchType::Domain),
            6 => Some(SearchType::App),
            7 => Some(SearchType::MiniProgram),
            8 => Some(SearchType::FastApp),
            _ => None,
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchType::Domain => "domain",
            SearchType::App => "app",
            SearchType::MiniProgram => "mini_program",
            SearchType::FastApp => "fast_app",
        };
        f.write_str(name)
    }
}

/// Website filing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub content_type_name: String,
    pub domain: String,
    pub domain_id: i64,
    pub leader_name: String,
    pub limit_access: String,
    pub main_id: i64,
    pub main_licence: String,
    pub nature_name: String,
    pub service_id: i64,
    pub service_licence: String,
    pub unit_name: String,
    #[serde(deserialize_with = "deserialize_record_time")]
    pub update_record_time: NaiveDateTime,
}

/// App, mini program or fast app filing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub city_id: i64,
    pub county_id: i64,
    pub data_id: i64,
    pub leader_name: String,
    pub main_licence: String,
    pub main_unit_address: String,
    pub main_unit_cert_no: String,
    pub main_unit_cert_type: i64,
    pub nature_id: i64,
    pub province_id: i64,
    pub service_name: String,
    pub service_type: i64,
    pub version: String,
    pub content_type_name: String,
    pub main_id: i64,
    pub nature_name: String,
    pub service_id: i64,
    pub service_licence: String,
    pub unit_name: String,
    #[serde(deserialize_with = "deserialize_record_time")]
    pub update_record_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryRecord {
    Site(SiteRecord),
    App(AppRecord),
}

impl QueryRecord {
    pub fn unit_name(&self) -> &str {
        match self {
            QueryRecord::Site(site) => &site.unit_name,
            QueryRecord::App(app) => &app.unit_name,
        }
    }

    pub fn service_licence(&self) -> &str {
        match self {
            QueryRecord::Site(site) => &site.service_licence,
            QueryRecord::App(app) => &app.service_licence,
        }
    }

    pub fn update_record_time(&self) -> NaiveDateTime {
        match self {
            QueryRecord::Site(site) => site.update_record_time,
            QueryRecord::App(app) => app.update_record_time,
        }
    }
}

/// One page of query results. An empty page is a valid answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub search_type: SearchType,
    pub records: Vec<QueryRecord>,
    pub total: Option<u64>,
}

impl QueryResponse {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueryRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a QueryResponse {
    type Item = &'a QueryRecord;
    type IntoIter = std::slice::Iter<'a, QueryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parses `YYYY-MM-DD HH:MM:SS`, falling back to RFC 3339.
pub fn parse_record_time(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, RECORD_TIME_FORMAT)
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|time| time.naive_local())
        })
}

fn deserialize_record_time<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_record_time(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid record time '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    #[test]
    fn search_type_codes() {
        assert_eq!(SearchType::Domain.code(), 1);
        assert_eq!(SearchType::App.code(), 6);
        assert_eq!(SearchType::MiniProgram.code(), 7);
        assert_eq!(SearchType::FastApp.code(), 8);
        assert_eq!(SearchType::from_code(7), Some(SearchType::MiniProgram));
        assert_eq!(SearchType::from_code(2), None);
    }

    #[test]
    fn parses_both_time_formats() {
        let plain = parse_record_time("2023-05-17 09:30:12").unwrap();
        assert_eq!(plain.date(), NaiveDate::from_ymd_opt(2023, 5, 17).unwrap());
        assert_eq!(plain.hour(), 9);
        let rfc = parse_record_time("2023-05-17T09:30:12+08:00").unwrap();
        assert_eq!(rfc, plain);
        assert!(parse_record_time("yesterday").is_none());
    }

    #[test]
    fn site_record_from_api_json() {
        let json = r#"{
            "contentTypeName": "",
            "domain": "example.cn",
            "domainId": 1024,
            "leaderName": "",
            "limitAccess": "否",
            "mainId": 77,
            "mainLicence": "京ICP备00000000号",
            "natureName": "企业",
            "serviceId": 88,
            "serviceLicence": "京ICP备00000000号-1",
            "unitName": "示例科技有限公司",
            "updateRecordTime": "2022-01-04 10:11:12"
        }"#;
        let record: SiteRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.domain, "example.cn");
        assert_eq!(record.update_record_time.minute(), 11);
    }
}
