//! Diesel table definitions for the queue tables created by `migrations/`.

diesel::table! {
    /// Active jobs. A row leaves this table when the job reaches a terminal
    /// state and is moved to `job_history`.
    jobs (id) {
        id -> Int8,
        queue_name -> Text,
        priority -> Int2,
        payload -> Jsonb,
        unique_key -> Nullable<Text>,
        attempts -> Int4,
        max_attempts -> Int4,
        available_at -> Timestamptz,
        lease_owner -> Nullable<Text>,
        lease_until -> Nullable<Timestamptz>,
        started_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Append-only archive of completed and dead-lettered jobs.
    job_history (id) {
        id -> Int8,
        queue_name -> Text,
        priority -> Int2,
        unique_key -> Nullable<Text>,
        status_final -> Text,
        payload -> Jsonb,
        result_or_error -> Jsonb,
        attempts -> Int4,
        max_attempts -> Int4,
        processed_by -> Text,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(jobs, job_history);
