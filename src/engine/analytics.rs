use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike};

use crate::limits::MAX_REPORT_MONTHS;
use crate::model::*;

use super::{Engine, EngineError};

/// UTC (year, month) containing `ms`.
fn month_of(ms: Ms) -> Option<(i32, u32)> {
    DateTime::from_timestamp_millis(ms).map(|dt| (dt.year(), dt.month()))
}

fn previous_month((year, month): (i32, u32)) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

impl Engine {
    /// Confirmed booking revenue per resource type, highest first. Types
    /// without confirmed bookings report zero.
    pub async fn revenue_by_type(&self) -> Vec<TypeRevenue> {
        let mut totals: HashMap<String, (u64, u64)> = HashMap::new();
        for slot in self.all_slots() {
            let rs = slot.read().await;
            let (bookings, revenue) = totals.entry(rs.resource_type.clone()).or_default();
            for b in rs.bookings.values().filter(|b| b.is_confirmed()) {
                *bookings += 1;
                *revenue = revenue.saturating_add(b.total_price_cents);
            }
        }

        let mut out: Vec<TypeRevenue> = totals
            .into_iter()
            .map(|(resource_type, (bookings, revenue_cents))| TypeRevenue {
                resource_type,
                bookings,
                revenue_cents,
            })
            .collect();
        out.sort_by(|a, b| {
            b.revenue_cents
                .cmp(&a.revenue_cents)
                .then_with(|| a.resource_type.cmp(&b.resource_type))
        });
        out
    }

    /// Bookings per UTC calendar month of their start, for the `months`
    /// months ending with the one containing `until`. Oldest month first;
    /// empty months are included.
    pub async fn bookings_by_month(
        &self,
        months: u32,
        until: Ms,
    ) -> Result<Vec<MonthlyBookings>, EngineError> {
        if !(1..=MAX_REPORT_MONTHS).contains(&months) {
            return Err(EngineError::validation(format!(
                "months must be between 1 and {MAX_REPORT_MONTHS}"
            )));
        }
        let mut key = month_of(until).ok_or(EngineError::LimitExceeded("timestamp out of range"))?;

        let mut buckets = BTreeMap::new();
        for _ in 0..months {
            let (year, month) = key;
            buckets.insert(
                key,
                MonthlyBookings {
                    year,
                    month,
                    confirmed: 0,
                    cancelled: 0,
                    revenue_cents: 0,
                },
            );
            key = previous_month(key);
        }

        for slot in self.all_slots() {
            let rs = slot.read().await;
            for b in rs.bookings.values() {
                let Some(bucket) = month_of(b.span.start).and_then(|k| buckets.get_mut(&k)) else {
                    continue;
                };
                if b.is_confirmed() {
                    bucket.confirmed += 1;
                    bucket.revenue_cents = bucket.revenue_cents.saturating_add(b.total_price_cents);
                } else {
                    bucket.cancelled += 1;
                }
            }
        }
        Ok(buckets.into_values().collect())
    }
}
