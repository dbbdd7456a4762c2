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

//! Diesel table definitions for the two logical tables named in §6:
//! `collection(id, exec_time, taken_by_instance, task_count)` and
//! `task(id, collection_id, exec_time)`.
//!
//! Columns use `Text`/`BigInt` rather than backend-native `Uuid`/`Timestamptz`
//! so the same schema serves both the Postgres and SQLite code paths (see
//! [`super::universal_types`]).

diesel::table! {
    collections (id) {
        id -> Text,
        exec_time -> BigInt,
        task_count -> BigInt,
        taken_by_instance -> Nullable<BigInt>,
    }
}

diesel::table! {
    tasks (id) {
        id -> Text,
        collection_id -> Text,
        exec_time -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(collections, tasks);
diesel::joinable!(tasks -> collections (collection_id));
