//! Cursor based pagination over tenant scoped tables
//!
//! A [`PaginationCursor`] names the resource, the page size, the position
//! (zero-based page number or a keyset [`PageToken`]) and the filter
//! [`Scope`]s for one request. The PostgreSQL repositories turn it into SQL
//! with [`PaginationCursor::select_query`]; the in-memory repositories run the
//! same rules through [`paginate_in_memory`].
//!
//! Listings are ordered by `created_at DESC, id DESC`. The id breaks ties
//! between rows sharing a timestamp, so consecutive pages never overlap.
//!
//! [`SegmentScan`] is the ascending keyset scan used to resolve segment
//! membership for bulk sends.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use mailflock_common::types::{CampaignId, SegmentId, UserId};
use mailflock_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashSet};

use crate::models::{
    Bounce, Campaign, Click, Complaint, Delivery, Open, Segment, Subscriber,
};

/// Page size used when the caller does not ask for one
pub const DEFAULT_PER_PAGE: i64 = 10;

/// Hard ceiling on page size
pub const MAX_PER_PAGE: i64 = 100;

/// Clamp a requested page size into `1..=MAX_PER_PAGE`
pub fn clamp_per_page(requested: Option<i64>) -> i64 {
    match requested {
        Some(n) if n > 0 => n.min(MAX_PER_PAGE),
        _ => DEFAULT_PER_PAGE,
    }
}

/// Paginated resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Subscribers,
    Segments,
    Campaigns,
    Opens,
    Clicks,
    Bounces,
    Complaints,
    Deliveries,
}

impl Resource {
    /// Backing table
    pub fn table(self) -> &'static str {
        match self {
            Resource::Subscribers => "subscribers",
            Resource::Segments => "segments",
            Resource::Campaigns => "campaigns",
            Resource::Opens => "opens",
            Resource::Clicks => "clicks",
            Resource::Bounces => "bounces",
            Resource::Complaints => "complaints",
            Resource::Deliveries => "deliveries",
        }
    }

    fn select_columns(self) -> &'static str {
        match self {
            Resource::Segments => {
                "segments.*, (SELECT COUNT(*) FROM subscribers_segments ss \
                 WHERE ss.segment_id = segments.id) AS subscribers_in_segment"
            }
            _ => "*",
        }
    }

    /// Translate a caller supplied filter mapping into scopes.
    ///
    /// Keys a resource does not know are ignored.
    pub fn scopes_from(self, filters: &BTreeMap<String, String>) -> Vec<Scope> {
        filters
            .iter()
            .filter_map(|(key, value)| match (self, key.as_str()) {
                (Resource::Campaigns | Resource::Segments | Resource::Subscribers, "name") => {
                    Some(Scope::NameLike(value.clone()))
                }
                (Resource::Campaigns, "template_name") => {
                    Some(Scope::TemplateNameLike(value.clone()))
                }
                (Resource::Subscribers, "email") => Some(Scope::EmailLike(value.clone())),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

impl std::str::FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subscribers" => Ok(Resource::Subscribers),
            "segments" => Ok(Resource::Segments),
            "campaigns" => Ok(Resource::Campaigns),
            "opens" => Ok(Resource::Opens),
            "clicks" => Ok(Resource::Clicks),
            "bounces" => Ok(Resource::Bounces),
            "complaints" => Ok(Resource::Complaints),
            "deliveries" => Ok(Resource::Deliveries),
            other => Err(Error::NotFound(format!("Unknown resource: {}", other))),
        }
    }
}

/// Named filter predicate appended to a paginated query.
///
/// Prefix scopes anchor at the start of the value; only a trailing wildcard
/// is ever added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    NameLike(String),
    TemplateNameLike(String),
    EmailLike(String),
    InSegment(SegmentId),
    ForCampaign(CampaignId),
}

impl Scope {
    fn push_sql(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        match self {
            Scope::NameLike(prefix) => {
                qb.push(" AND name LIKE ").push_bind(like_prefix(prefix));
            }
            Scope::TemplateNameLike(prefix) => {
                qb.push(" AND template_name LIKE ")
                    .push_bind(like_prefix(prefix));
            }
            Scope::EmailLike(prefix) => {
                qb.push(" AND email LIKE ").push_bind(like_prefix(prefix));
            }
            Scope::InSegment(segment_id) => {
                qb.push(
                    " AND EXISTS (SELECT 1 FROM subscribers_segments ss \
                     WHERE ss.subscriber_id = subscribers.id AND ss.segment_id = ",
                )
                .push_bind(*segment_id)
                .push(")");
            }
            Scope::ForCampaign(campaign_id) => {
                qb.push(" AND campaign_id = ").push_bind(*campaign_id);
            }
        }
    }

    /// Evaluate the scope against an in-memory row
    pub fn matches<T: Pageable + ?Sized>(&self, row: &T) -> bool {
        match self {
            Scope::NameLike(prefix) => row.field("name").is_some_and(|v| v.starts_with(prefix.as_str())),
            Scope::TemplateNameLike(prefix) => row
                .field("template_name")
                .is_some_and(|v| v.starts_with(prefix.as_str())),
            Scope::EmailLike(prefix) => row.field("email").is_some_and(|v| v.starts_with(prefix.as_str())),
            Scope::InSegment(segment_id) => row.in_segment(*segment_id),
            Scope::ForCampaign(campaign_id) => row.campaign() == Some(*campaign_id),
        }
    }
}

/// Escape LIKE metacharacters and append the trailing wildcard
fn like_prefix(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 1);
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Row that can be listed through a [`PaginationCursor`]
pub trait Pageable {
    /// `(created_at, id)` ordering key
    fn page_key(&self) -> (DateTime<Utc>, i64);

    /// Owning user
    fn owner(&self) -> UserId;

    /// String column used by prefix scopes
    fn field(&self, _name: &str) -> Option<&str> {
        None
    }

    fn in_segment(&self, _segment_id: SegmentId) -> bool {
        false
    }

    fn campaign(&self) -> Option<CampaignId> {
        None
    }
}

impl Pageable for Subscriber {
    fn page_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }

    fn owner(&self) -> UserId {
        self.user_id
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "name" => Some(&self.name),
            "email" => Some(&self.email),
            _ => None,
        }
    }

    fn in_segment(&self, segment_id: SegmentId) -> bool {
        self.segments.iter().any(|s| s.id == segment_id)
    }
}

impl Pageable for Segment {
    fn page_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }

    fn owner(&self) -> UserId {
        self.user_id
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

impl Pageable for Campaign {
    fn page_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }

    fn owner(&self) -> UserId {
        self.user_id
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "name" => Some(&self.name),
            "template_name" => Some(&self.template_name),
            _ => None,
        }
    }
}

macro_rules! campaign_event_pageable {
    ($($event:ty),+) => {
        $(
            impl Pageable for $event {
                fn page_key(&self) -> (DateTime<Utc>, i64) {
                    (self.created_at, self.id)
                }

                fn owner(&self) -> UserId {
                    self.user_id
                }

                fn campaign(&self) -> Option<CampaignId> {
                    Some(self.campaign_id)
                }
            }
        )+
    };
}

campaign_event_pageable!(Open, Click, Bounce, Complaint, Delivery);

/// Keyset position: the `(created_at, id)` of the last row already seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

impl PageToken {
    pub fn of<T: Pageable + ?Sized>(row: &T) -> Self {
        let (created_at, id) = row.page_key();
        Self { created_at, id }
    }

    fn key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }

    /// Opaque URL safe form handed to callers
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.id
        );
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || Error::invalid_field("cursor", "Invalid page cursor");

        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (ts, id) = raw.split_once('|').ok_or_else(invalid)?;

        let created_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| invalid())?
            .with_timezone(&Utc);
        let id = id.parse::<i64>().map_err(|_| invalid())?;

        Ok(Self { created_at, id })
    }
}

/// Where a page starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePosition {
    /// Zero-based page number; skips `page * per_page` rows
    Offset { page: i64 },
    /// Rows strictly after the token in listing order
    After(PageToken),
}

/// Request scoped description of one page
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    pub resource: Resource,
    per_page: i64,
    pub position: PagePosition,
    pub scopes: Vec<Scope>,
}

impl PaginationCursor {
    /// Cursor for the first page; `per_page` is clamped
    pub fn new(resource: Resource, per_page: Option<i64>) -> Self {
        Self {
            resource,
            per_page: clamp_per_page(per_page),
            position: PagePosition::Offset { page: 0 },
            scopes: Vec::new(),
        }
    }

    /// Cursor for a resource named by tag. Unknown tags are `NotFound`.
    pub fn for_resource(resource: &str, per_page: Option<i64>) -> Result<Self> {
        Ok(Self::new(resource.parse()?, per_page))
    }

    pub fn per_page(&self) -> i64 {
        self.per_page
    }

    pub fn page(mut self, page: i64) -> Self {
        self.position = PagePosition::Offset { page: page.max(0) };
        self
    }

    pub fn after(mut self, token: PageToken) -> Self {
        self.position = PagePosition::After(token);
        self
    }

    /// Continue from an encoded token, or start at the first page when absent
    pub fn starting_after(self, token: Option<&str>) -> Result<Self> {
        match token {
            Some(t) => Ok(self.after(PageToken::decode(t)?)),
            None => Ok(self),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scopes.push(scope);
        self
    }

    /// Add the scopes the resource understands from a filter mapping
    pub fn with_filters(mut self, filters: &BTreeMap<String, String>) -> Self {
        let scopes = self.resource.scopes_from(filters);
        self.scopes.extend(scopes);
        self
    }

    /// Rows skipped before the page. A page too far out to address is a
    /// validation error on `page`.
    pub fn offset(&self) -> Result<i64> {
        match self.position {
            PagePosition::Offset { page } => page
                .checked_mul(self.per_page)
                .ok_or_else(|| Error::invalid_field("page", "The page number is too large.")),
            PagePosition::After(_) => Ok(0),
        }
    }

    fn push_filters(&self, qb: &mut QueryBuilder<'static, Postgres>, user_id: UserId) {
        qb.push(" WHERE user_id = ").push_bind(user_id);
        for scope in &self.scopes {
            scope.push_sql(qb);
        }
    }

    /// Page query. Fetches one row past the page so `has_more` is exact.
    pub fn select_query(&self, user_id: UserId) -> Result<QueryBuilder<'static, Postgres>> {
        let offset = self.offset()?;
        let mut qb = QueryBuilder::new("SELECT ");
        qb.push(self.resource.select_columns())
            .push(" FROM ")
            .push(self.resource.table());
        self.push_filters(&mut qb, user_id);

        if let PagePosition::After(token) = self.position {
            qb.push(" AND (created_at < ")
                .push_bind(token.created_at)
                .push(" OR (created_at = ")
                .push_bind(token.created_at)
                .push(" AND id < ")
                .push_bind(token.id)
                .push("))");
        }

        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(self.per_page + 1);

        if offset > 0 {
            qb.push(" OFFSET ").push_bind(offset);
        }
        Ok(qb)
    }

    /// Total rows matching the user and scopes, ignoring position
    pub fn count_query(&self, user_id: UserId) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM ");
        qb.push(self.resource.table());
        self.push_filters(&mut qb, user_id);
        qb
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize)]
pub struct Pagination<T> {
    pub collection: Vec<T>,
    pub total: i64,
    pub per_page: i64,
    /// Page number for offset pages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Token for the following page when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl<T: Pageable> Pagination<T> {
    /// Build a page from up to `per_page + 1` ordered rows
    pub fn from_rows(cursor: &PaginationCursor, mut rows: Vec<T>, total: i64) -> Self {
        let per_page = cursor.per_page();
        let has_more = rows.len() as i64 > per_page;
        rows.truncate(per_page as usize);

        let next_cursor = if has_more {
            rows.last().map(|row| PageToken::of(row).encode())
        } else {
            None
        };

        let page = match cursor.position {
            PagePosition::Offset { page } => Some(page),
            PagePosition::After(_) => None,
        };

        Self {
            collection: rows,
            total,
            per_page,
            page,
            next_cursor,
            has_more,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }
}

/// Apply a cursor to rows held in memory, with the same ordering, scoping
/// and page boundaries as the SQL form.
pub fn paginate_in_memory<'a, T, I>(
    cursor: &PaginationCursor,
    user_id: UserId,
    rows: I,
) -> Result<Pagination<T>>
where
    T: Pageable + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut matching: Vec<&T> = rows
        .into_iter()
        .filter(|row| row.owner() == user_id)
        .filter(|row| cursor.scopes.iter().all(|scope| scope.matches(*row)))
        .collect();
    matching.sort_by(|a, b| b.page_key().cmp(&a.page_key()));

    let total = matching.len() as i64;
    let take = (cursor.per_page() + 1) as usize;
    let skip = usize::try_from(cursor.offset()?).unwrap_or(usize::MAX);

    let page: Vec<T> = match cursor.position {
        PagePosition::Offset { .. } => matching
            .into_iter()
            .skip(skip)
            .take(take)
            .cloned()
            .collect(),
        PagePosition::After(token) => matching
            .into_iter()
            .filter(|row| row.page_key() < token.key())
            .take(take)
            .cloned()
            .collect(),
    };

    Ok(Pagination::from_rows(cursor, page, total))
}

/// Ascending keyset scan over the distinct members of a set of segments.
///
/// Each call returns at most `limit` subscribers ordered by
/// `(created_at, id)`. Advancing `after` to the last row returned walks the
/// whole membership exactly once. Rows created at or after `snapshot_at`
/// are never returned, so a scan sees the membership as it was when it began.
#[derive(Debug, Clone)]
pub struct SegmentScan {
    pub user_id: UserId,
    pub segment_ids: Vec<SegmentId>,
    pub blacklisted: bool,
    pub active: bool,
    pub after: Option<PageToken>,
    pub snapshot_at: DateTime<Utc>,
    pub limit: i64,
}

impl SegmentScan {
    pub const DEFAULT_LIMIT: i64 = 1000;

    /// Scan for active, non-blacklisted members
    pub fn eligible(
        user_id: UserId,
        segment_ids: Vec<SegmentId>,
        snapshot_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            segment_ids,
            blacklisted: false,
            active: true,
            after: None,
            snapshot_at,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    /// Set the batch size; non-positive values fall back to the default
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = if limit > 0 { limit } else { Self::DEFAULT_LIMIT };
        self
    }

    /// Move past the last row of a batch
    pub fn advance_past<T: Pageable + ?Sized>(&mut self, last: &T) {
        self.after = Some(PageToken::of(last));
    }

    pub fn query(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("SELECT subscribers.* FROM subscribers WHERE user_id = ");
        qb.push_bind(self.user_id)
            .push(" AND blacklisted = ")
            .push_bind(self.blacklisted)
            .push(" AND active = ")
            .push_bind(self.active)
            .push(
                " AND EXISTS (SELECT 1 FROM subscribers_segments ss \
                 WHERE ss.subscriber_id = subscribers.id AND ss.segment_id = ANY(",
            )
            .push_bind(self.segment_ids.clone())
            .push("))");

        if let Some(token) = self.after {
            qb.push(" AND (created_at > ")
                .push_bind(token.created_at)
                .push(" OR (created_at = ")
                .push_bind(token.created_at)
                .push(" AND id > ")
                .push_bind(token.id)
                .push("))");
        }

        qb.push(" AND created_at < ")
            .push_bind(self.snapshot_at)
            .push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(self.limit);
        qb
    }

    /// Whether a subscriber with the given memberships belongs in this scan
    pub fn matches(&self, subscriber: &Subscriber, memberships: &HashSet<SegmentId>) -> bool {
        subscriber.user_id == self.user_id
            && subscriber.blacklisted == self.blacklisted
            && subscriber.active == self.active
            && subscriber.created_at < self.snapshot_at
            && self.segment_ids.iter().any(|id| memberships.contains(id))
            && self
                .after
                .map_or(true, |token| subscriber.page_key() > token.key())
    }
}
