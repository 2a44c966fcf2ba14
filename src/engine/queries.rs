use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::request::{BookingQuery, Period, SortField};
use super::{now_ms, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomCount {
    pub room_id: Ulid,
    pub room_name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayCount {
    /// Local calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub count: usize,
}

/// Dashboard aggregates over bookings created within a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub period: &'static str,
    pub from: String,
    pub to: String,
    pub total: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    /// Percentage of bookings approved, two decimals.
    pub approval_rate: f64,
    pub top_rooms: Vec<RoomCount>,
    pub trend: Vec<DayCount>,
}

fn compare(a: &Booking, b: &Booking, field: SortField) -> Ordering {
    let primary = match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::StartTime => a.span.start.cmp(&b.span.start),
        SortField::EndTime => a.span.end.cmp(&b.span.end),
        SortField::ActivityName => a
            .activity_name
            .to_lowercase()
            .cmp(&b.activity_name.to_lowercase()),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

fn matches_search(b: &Booking, room_name: &str, needle: &str) -> bool {
    let hit = |s: &str| s.to_lowercase().contains(needle);
    hit(&b.activity_name)
        || b.purpose.as_deref().is_some_and(hit)
        || hit(&b.requester.name)
        || hit(&b.requester.email)
        || hit(room_name)
}

fn paginate(mut items: Vec<Booking>, query: &BookingQuery) -> Result<Page<Booking>, EngineError> {
    if query.page == 0 {
        return Err(EngineError::invalid("page starts at 1"));
    }
    if query.limit == 0 || query.limit > MAX_PAGE_SIZE {
        return Err(EngineError::invalid(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    items.sort_by(|a, b| {
        let ord = compare(a, b, query.sort);
        if query.descending { ord.reverse() } else { ord }
    });
    let total = items.len();
    let total_pages = total.div_ceil(query.limit);
    let items = items
        .into_iter()
        .skip((query.page - 1).saturating_mul(query.limit))
        .take(query.limit)
        .collect();
    Ok(Page {
        items,
        page: query.page,
        limit: query.limit,
        total,
        total_pages,
    })
}

impl Engine {
    /// Administrators see every room; everyone else sees active rooms only.
    pub async fn list_rooms(&self, caller: &Caller) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if caller.is_admin() || guard.room.active {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        rooms
    }

    pub async fn room_names(&self) -> HashMap<Ulid, String> {
        let mut names = HashMap::with_capacity(self.rooms.len());
        for rs in self.room_handles() {
            let guard = rs.read().await;
            names.insert(guard.room.id, guard.room.name.clone());
        }
        names
    }

    /// Owner or administrator only.
    pub async fn get_booking(&self, caller: &Caller, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self
            .room_for_booking(&id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let guard = rs.read().await;
        let booking = guard
            .booking(id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        if !booking.is_owned_by(caller) && !caller.is_admin() {
            return Err(EngineError::Forbidden("not your booking"));
        }
        Ok(booking.clone())
    }

    /// The caller's own bookings. Only status, sort and paging apply.
    pub async fn list_own_bookings(
        &self,
        caller: &Caller,
        query: &BookingQuery,
    ) -> Result<Page<Booking>, EngineError> {
        let own = BookingQuery {
            user_id: Some(caller.id),
            room_id: None,
            from: None,
            to: None,
            search: None,
            ..query.clone()
        };
        let items = self.collect_bookings(&own).await;
        paginate(items, &own)
    }

    /// Filtered listing across every room. Search runs before pagination
    /// so totals count only matching bookings.
    pub async fn list_bookings(
        &self,
        caller: &Caller,
        query: &BookingQuery,
    ) -> Result<Page<Booking>, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only administrators can list all bookings"));
        }
        let items = self.collect_bookings(query).await;
        paginate(items, query)
    }

    async fn collect_bookings(&self, query: &BookingQuery) -> Vec<Booking> {
        let needle = query
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let mut out = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if query.room_id.is_some_and(|r| r != guard.room.id) {
                continue;
            }
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| query.status.is_none_or(|s| b.status == s))
                    .filter(|b| query.user_id.is_none_or(|u| b.requester_id == u))
                    .filter(|b| query.from.is_none_or(|t| b.span.start >= t))
                    .filter(|b| query.to.is_none_or(|t| b.span.end <= t))
                    .filter(|b| {
                        needle
                            .as_deref()
                            .is_none_or(|n| matches_search(b, &guard.room.name, n))
                    })
                    .cloned(),
            );
        }
        out
    }

    /// Aggregates over bookings created between the start of the period and now.
    pub async fn statistics(&self, caller: &Caller, period: Period) -> Result<Statistics, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only administrators can view statistics"));
        }
        let tz = self.default_tz;
        let now = now_ms();
        let now_local = DateTime::<Utc>::from_timestamp_millis(now)
            .ok_or_else(|| EngineError::Internal("clock out of range".into()))?
            .with_timezone(&tz);
        let start_local = match period {
            Period::Week => Some(now_local - chrono::Duration::days(7)),
            Period::Month => now_local.checked_sub_months(Months::new(1)),
            Period::Year => now_local.checked_sub_months(Months::new(12)),
        }
        .ok_or_else(|| EngineError::Internal("period start out of range".into()))?;
        let from = start_local.timestamp_millis();

        let mut by_status: BTreeMap<&'static str, usize> =
            BookingStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        let mut per_room: HashMap<Ulid, RoomCount> = HashMap::new();
        let mut per_day: BTreeMap<String, usize> = BTreeMap::new();
        let mut total = 0usize;

        for rs in self.room_handles() {
            let guard = rs.read().await;
            for b in guard
                .bookings
                .iter()
                .filter(|b| b.created_at >= from && b.created_at <= now)
            {
                total += 1;
                *by_status.entry(b.status.as_str()).or_default() += 1;
                per_room
                    .entry(guard.room.id)
                    .or_insert_with(|| RoomCount {
                        room_id: guard.room.id,
                        room_name: guard.room.name.clone(),
                        count: 0,
                    })
                    .count += 1;
                if let Some(created) = DateTime::<Utc>::from_timestamp_millis(b.created_at) {
                    let day = created.with_timezone(&tz).format("%Y-%m-%d").to_string();
                    *per_day.entry(day).or_default() += 1;
                }
            }
        }

        let approved = by_status
            .get(BookingStatus::Approved.as_str())
            .copied()
            .unwrap_or(0);
        let approval_rate = if total == 0 {
            0.0
        } else {
            (approved as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        let mut top_rooms: Vec<RoomCount> = per_room.into_values().collect();
        top_rooms.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.room_name.cmp(&b.room_name))
        });
        top_rooms.truncate(TOP_ROOMS);

        Ok(Statistics {
            period: period.as_str(),
            from: format_ms(from),
            to: format_ms(now),
            total,
            by_status,
            approval_rate,
            top_rooms,
            trend: per_day
                .into_iter()
                .map(|(date, count)| DayCount { date, count })
                .collect(),
        })
    }

    /// Approved bookings starting within the next `days` days, soonest first.
    pub async fn upcoming(&self, caller: &Caller, days: u32) -> Result<Vec<Booking>, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only administrators can view upcoming bookings"));
        }
        if days == 0 || days > MAX_UPCOMING_DAYS {
            return Err(EngineError::invalid(format!(
                "days must be between 1 and {MAX_UPCOMING_DAYS}"
            )));
        }
        let now = now_ms();
        let horizon = now + i64::from(days) * 86_400_000;
        let window = Span::new(now, horizon + 1);

        let mut out = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Approved)
                    .filter(|b| window.contains_instant(b.span.start))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| compare(a, b, SortField::StartTime));
        Ok(out)
    }

    /// Snapshot of the room handles so no map shard lock is held across an await.
    fn room_handles(&self) -> Vec<super::SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }
}
