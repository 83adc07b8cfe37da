//! Spreadsheet export: one worksheet per service type, written in full at
//! the end of the run (including on interrupt, so partial progress is
//! never discarded).

use std::path::Path;

use chrono::Local;
use log::info;
use rust_xlsxwriter::{Workbook, XlsxError};

use crate::models::{ResultRecord, ServiceType};

const BASE_COLUMNS: &[&str] = &["unitName", "mainLicence", "serviceLicence", "updateRecordTime"];

/// Accumulated records, bucketed per service type in first-seen order.
#[derive(Debug, Default)]
pub struct ResultSet {
    buckets: Vec<(ServiceType, Vec<ResultRecord>)>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, service_type: ServiceType, records: Vec<ResultRecord>) {
        if let Some((_, bucket)) = self.buckets.iter_mut().find(|(t, _)| *t == service_type) {
            bucket.extend(records);
        } else {
            self.buckets.push((service_type, records));
        }
    }

    pub fn total(&self) -> usize {
        self.buckets.iter().map(|(_, b)| b.len()).sum()
    }

    pub fn records(&self, service_type: ServiceType) -> &[ResultRecord] {
        self.buckets
            .iter()
            .find(|(t, _)| *t == service_type)
            .map(|(_, b)| b.as_slice())
            .unwrap_or(&[])
    }
}

/// Timestamped default output name.
pub fn default_filename() -> String {
    format!("results_{}.xlsx", Local::now().format("%Y%m%d_%H%M%S"))
}

pub fn write_workbook(results: &ResultSet, path: &Path) -> Result<(), XlsxError> {
    let mut workbook = Workbook::new();

    if results.total() == 0 {
        let sheet = workbook.add_worksheet();
        sheet.set_name("summary")?;
        sheet.write_string(0, 0, "no records found")?;
    } else {
        for (service_type, records) in &results.buckets {
            if records.is_empty() {
                continue;
            }
            let sheet = workbook.add_worksheet();
            sheet.set_name(service_type.label())?;

            let mut columns: Vec<&str> = BASE_COLUMNS.to_vec();
            if *service_type == ServiceType::Web {
                columns.push("domain");
            } else {
                columns.extend(["serviceName", "leaderName", "mainUnitAddress"]);
            }
            for (col, name) in columns.iter().enumerate() {
                sheet.write_string(0, col as u16, *name)?;
            }

            for (row, record) in records.iter().enumerate() {
                let row = row as u32 + 1;
                let mut values: Vec<&Option<String>> = vec![
                    &record.unit_name,
                    &record.main_licence,
                    &record.service_licence,
                    &record.update_record_time,
                ];
                if *service_type == ServiceType::Web {
                    values.push(&record.domain);
                } else {
                    values.push(&record.service_name);
                    values.push(&record.leader_name);
                    values.push(&record.main_unit_address);
                }
                for (col, value) in values.iter().enumerate() {
                    if let Some(v) = value {
                        sheet.write_string(row, col as u16, v)?;
                    }
                }
            }
        }
    }

    workbook.save(path)?;
    info!("results written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, domain: Option<&str>) -> ResultRecord {
        ResultRecord {
            unit_name: Some(name.to_string()),
            main_licence: Some("京ICP备1号".to_string()),
            domain: domain.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_result_set_buckets_by_type() {
        let mut set = ResultSet::new();
        set.push(ServiceType::Web, vec![record("a", Some("a.cn"))]);
        set.push(ServiceType::App, vec![record("b", None)]);
        set.push(ServiceType::Web, vec![record("c", Some("c.cn"))]);
        assert_eq!(set.total(), 3);
        assert_eq!(set.records(ServiceType::Web).len(), 2);
        assert_eq!(set.records(ServiceType::MiniApp).len(), 0);
    }

    #[test]
    fn test_write_workbook_with_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let mut set = ResultSet::new();
        set.push(ServiceType::Web, vec![record("某某科技有限公司", Some("example.cn"))]);
        set.push(ServiceType::App, vec![record("某某科技有限公司", None)]);

        write_workbook(&set, &path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.len() > 0);
    }

    #[test]
    fn test_write_workbook_empty_gets_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.xlsx");
        write_workbook(&ResultSet::new(), &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_default_filename_shape() {
        let name = default_filename();
        assert!(name.starts_with("results_"));
        assert!(name.ends_with(".xlsx"));
    }
}
