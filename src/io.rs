use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use itertools::Itertools;

use crate::error::ItemKey;

pub type PackageId = u64;

/// One listen of an item, at a point in time.
pub type Listen = (ItemKey, DateTime<Utc>);

fn to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos).single()
}

/// Read a tab separated listening log with a header and the columns
/// `package_id item_key time`, time given in seconds since the epoch.
///
/// Listens are grouped by package id, ordered by time within each package, and
/// the packages are ordered by their first listen.
pub fn read_listening_log<P: AsRef<Path>>(path: P) -> Result<Vec<(PackageId, Vec<Listen>)>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("cannot open listening log {}", path.display()))?;

    let mut listens: Vec<(PackageId, Listen)> = Vec::new();
    for (line, result) in reader.deserialize().enumerate() {
        let (package_id, item_key, time): (PackageId, ItemKey, f64) =
            result.with_context(|| format!("malformed record {} in {}", line + 1, path.display()))?;
        let at = to_datetime(time)
            .with_context(|| format!("invalid time {} in record {}", time, line + 1))?;
        listens.push((package_id, (item_key, at)));
    }

    let packages = listens
        .into_iter()
        .into_group_map()
        .into_iter()
        .map(|(package_id, mut package_listens)| {
            package_listens.sort_by_key(|(_, at)| *at);
            (package_id, package_listens)
        })
        .sorted_by_key(|(package_id, package_listens)| (package_listens[0].1, *package_id))
        .collect();

    Ok(packages)
}

#[cfg(test)]
mod io_test {
    use std::io::Write;

    use super::*;

    #[test]
    fn should_group_listens_into_packages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "package_id\titem_key\ttime").unwrap();
        writeln!(file, "7\t100\t1600000060").unwrap();
        writeln!(file, "7\t101\t1600000000").unwrap();
        writeln!(file, "3\t102\t1600000500.5").unwrap();
        writeln!(file, "7\t103\t1600000120").unwrap();
        file.flush().unwrap();

        let packages = read_listening_log(file.path()).unwrap();
        assert_eq!(2, packages.len());

        let (first_id, first) = &packages[0];
        assert_eq!(7, *first_id);
        let keys: Vec<ItemKey> = first.iter().map(|(key, _)| *key).collect();
        assert_eq!(vec![101, 100, 103], keys);

        let (second_id, second) = &packages[1];
        assert_eq!(3, *second_id);
        assert_eq!(500_000_000, second[0].1.timestamp_subsec_nanos());
    }

    #[test]
    fn should_report_malformed_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "package_id\titem_key\ttime").unwrap();
        writeln!(file, "1\tnot_a_number\t1600000000").unwrap();
        file.flush().unwrap();

        let error = read_listening_log(file.path()).unwrap_err();
        assert!(error.to_string().contains("malformed record 1"));
    }

    #[test]
    fn should_fail_on_missing_files() {
        assert!(read_listening_log("/nonexistent/listens.tsv").is_err());
    }
}
