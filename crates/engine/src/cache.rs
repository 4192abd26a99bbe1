//! On-disk kline cache, one CSV file per (symbol, UTC day)
//!
//! Layout: `{root}/{SYMBOL}/{YYYY-MM-DD}.csv`, rows
//! `openTime,open,high,low,close,volume`, no header.
//!
//! A day counts as cached only when its file holds at least
//! [`MIN_KLINES_PER_DAY`] rows. Writes go to a `.tmp` sibling first and are
//! renamed into place, so a reader never sees a half-written day.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use crate::types::{Kline, TimeRange, KLINE_INTERVAL_MS};

/// One 1s candle per second of the day
pub const EXPECTED_KLINES_PER_DAY: usize = 86_400;

/// Missing candles tolerated per day (exchange gaps, boundary seconds)
pub const MISSING_KLINES_TOLERANCE: usize = 60;

pub const MIN_KLINES_PER_DAY: usize = EXPECTED_KLINES_PER_DAY - MISSING_KLINES_TOLERANCE;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed row {line} in {path}: {reason}")]
    Parse {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("Incomplete data for {symbol} {day}: got {got} klines, expected ~{expected}")]
    IncompleteData {
        symbol: String,
        day: NaiveDate,
        got: usize,
        expected: usize,
    },
}

/// All cached candles of one day
#[derive(Debug, Clone)]
pub struct CachedDay {
    pub day: NaiveDate,
    pub klines: Vec<Kline>,
}

/// Per-symbol, per-day kline cache rooted at a directory
#[derive(Debug, Clone)]
pub struct KlineCache {
    root: PathBuf,
}

impl KlineCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{SYMBOL}/{day}.csv`
    pub fn day_path(&self, symbol: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join(symbol.to_uppercase())
            .join(format!("{}.csv", day.format("%Y-%m-%d")))
    }

    /// Days in `range` with no complete cache file, in order
    pub fn get_missing_days(&self, symbol: &str, range: TimeRange) -> Result<Vec<NaiveDate>, CacheError> {
        let mut missing = Vec::new();
        for day in range.days() {
            if !self.is_complete(symbol, day)? {
                missing.push(day);
            }
        }
        Ok(missing)
    }

    /// Whether the day's file exists and holds enough rows
    pub fn is_complete(&self, symbol: &str, day: NaiveDate) -> Result<bool, CacheError> {
        let path = self.day_path(symbol, day);
        if !path.exists() {
            return Ok(false);
        }
        let content = fs::read_to_string(&path).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        let rows = content.lines().filter(|l| !l.trim().is_empty()).count();
        Ok(rows >= MIN_KLINES_PER_DAY)
    }

    /// Persist a full day. Refuses days with fewer than [`MIN_KLINES_PER_DAY`] candles.
    pub fn cache_day(&self, symbol: &str, day: NaiveDate, klines: &[Kline]) -> Result<(), CacheError> {
        if klines.len() < MIN_KLINES_PER_DAY {
            return Err(CacheError::IncompleteData {
                symbol: symbol.to_uppercase(),
                day,
                got: klines.len(),
                expected: EXPECTED_KLINES_PER_DAY,
            });
        }

        let path = self.day_path(symbol, day);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| CacheError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = path.with_extension("csv.tmp");
        if let Err(e) = write_csv(&tmp_path, klines) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::Io {
                path: path.clone(),
                source,
            }
        })?;

        debug!(symbol, %day, klines = klines.len(), path = %path.display(), "Day cached");
        Ok(())
    }

    /// Lazily read every cached day in `range`, in day order. Days without a
    /// file are skipped. Each call starts a fresh pass.
    pub fn load_klines(&self, symbol: &str, range: TimeRange) -> CachedDays<'_> {
        CachedDays {
            cache: self,
            symbol: symbol.to_uppercase(),
            days: range.days().into_iter(),
        }
    }

    fn read_day(&self, symbol: &str, day: NaiveDate) -> Result<CachedDay, CacheError> {
        let path = self.day_path(symbol, day);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .map_err(|source| CacheError::Csv {
                path: path.clone(),
                source,
            })?;

        let mut klines = Vec::with_capacity(EXPECTED_KLINES_PER_DAY);
        for record in reader.records() {
            let record = record.map_err(|source| CacheError::Csv {
                path: path.clone(),
                source,
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let kline = parse_row(&record).map_err(|reason| CacheError::Parse {
                path: path.clone(),
                line,
                reason,
            })?;
            klines.push(kline);
        }

        Ok(CachedDay { day, klines })
    }
}

/// Iterator over cached days, produced by [`KlineCache::load_klines`]
pub struct CachedDays<'a> {
    cache: &'a KlineCache,
    symbol: String,
    days: std::vec::IntoIter<NaiveDate>,
}

impl Iterator for CachedDays<'_> {
    type Item = Result<CachedDay, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        for day in self.days.by_ref() {
            if self.cache.day_path(&self.symbol, day).exists() {
                return Some(self.cache.read_day(&self.symbol, day));
            }
        }
        None
    }
}

fn write_csv(path: &Path, klines: &[Kline]) -> Result<(), CacheError> {
    let file = File::create(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file);

    let csv_err = |source| CacheError::Csv {
        path: path.to_path_buf(),
        source,
    };

    for k in klines {
        writer
            .write_record([
                k.open_time.to_string(),
                k.open.to_string(),
                k.high.to_string(),
                k.low.to_string(),
                k.close.to_string(),
                k.volume.to_string(),
            ])
            .map_err(csv_err)?;
    }

    let file = writer.into_inner().map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e.into_error(),
    })?;
    file.sync_all().map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_row(record: &csv::StringRecord) -> Result<Kline, String> {
    if record.len() < 6 {
        return Err(format!("expected 6 fields, got {}", record.len()));
    }
    let field = |i: usize| record.get(i).unwrap_or_default().trim();
    let decimal = |i: usize| {
        Decimal::from_str(field(i)).map_err(|e| format!("field {i} ({:?}): {e}", field(i)))
    };

    let open_time: i64 = field(0)
        .parse()
        .map_err(|e| format!("open time {:?}: {e}", field(0)))?;

    Ok(Kline {
        open_time,
        open: decimal(1)?,
        high: decimal(2)?,
        low: decimal(3)?,
        close: decimal(4)?,
        volume: decimal(5)?,
        close_time: open_time + KLINE_INTERVAL_MS - 1,
    })
}
