/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Cross-backend identity and timestamp wrappers.
//!
//! Diesel's Postgres and SQLite backends disagree on the native wire
//! type for UUIDs and timestamps, so domain code stores and compares
//! [`UniversalUuid`] / [`UniversalTimestamp`] and only converts to a
//! backend-native representation inside the backend-specific DAL code.
//!
//! Both wrappers map onto a sql type with an identical representation on
//! every backend this crate selects at runtime (`Text` for the uuid,
//! `BigInt` for the timestamp, stored as Unix seconds), so
//! [`crate::database::schema`] declares one set of tables shared by the
//! Postgres and SQLite code paths instead of one schema per backend.

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::{BigInt, Text};
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
pub struct UniversalUuid(pub Uuid);

impl UniversalUuid {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for UniversalUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UniversalUuid {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<UniversalUuid> for Uuid {
    fn from(id: UniversalUuid) -> Self {
        id.0
    }
}

impl<DB> ToSql<Text, DB> for UniversalUuid
where
    DB: Backend,
    String: ToSql<Text, DB>,
{
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, DB>) -> serialize::Result {
        self.0.to_string().to_sql(out)
    }
}

impl<DB> FromSql<Text, DB> for UniversalUuid
where
    DB: Backend,
    String: FromSql<Text, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        let raw = String::from_sql(bytes)?;
        Ok(UniversalUuid(Uuid::parse_str(&raw)?))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = BigInt)]
pub struct UniversalTimestamp(pub DateTime<Utc>);

impl UniversalTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }

    /// Seconds since the epoch, the wire unit used by the core scheduling
    /// contract (`ExecTime`).
    pub fn as_secs(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now))
    }

    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)))
    }

    pub fn to_naive(&self) -> NaiveDateTime {
        self.0.naive_utc()
    }

    pub fn from_naive(naive: NaiveDateTime) -> Self {
        Self(DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}

impl fmt::Display for UniversalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl std::ops::Add<chrono::Duration> for UniversalTimestamp {
    type Output = UniversalTimestamp;

    fn add(self, rhs: chrono::Duration) -> Self::Output {
        UniversalTimestamp(self.0 + rhs)
    }
}

impl std::ops::Sub for UniversalTimestamp {
    type Output = chrono::Duration;

    fn sub(self, rhs: UniversalTimestamp) -> chrono::Duration {
        self.0 - rhs.0
    }
}

impl<DB> ToSql<BigInt, DB> for UniversalTimestamp
where
    DB: Backend,
    i64: ToSql<BigInt, DB>,
{
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, DB>) -> serialize::Result {
        self.as_secs().to_sql(out)
    }
}

impl<DB> FromSql<BigInt, DB> for UniversalTimestamp
where
    DB: Backend,
    i64: FromSql<BigInt, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        let secs = i64::from_sql(bytes)?;
        Ok(UniversalTimestamp::from_secs(secs))
    }
}
