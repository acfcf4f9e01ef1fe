// Kept in sync by hand with the DDL in schema.rs.

diesel::table! {
    careers (id) {
        id -> Text,
        title -> Text,
        description -> Nullable<Text>,
        steps_count -> Integer,
        order_epoch -> BigInt,
        courses_json -> Text,
        playlists_json -> Text,
        books_json -> Text,
        frozen_at -> Nullable<Text>,
        frozen_by -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    roadmap_steps (id) {
        id -> Text,
        career_id -> Text,
        order_index -> Integer,
        title -> Text,
        description -> Nullable<Text>,
        courses_json -> Text,
        playlists_json -> Text,
        books_json -> Text,
        allow_global_resources -> Bool,
        frozen_at -> Nullable<Text>,
        frozen_by -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    user_career_progress (id) {
        id -> Text,
        user_id -> Text,
        career_id -> Text,
        completed_steps_json -> Text,
        in_progress_step -> Nullable<Text>,
        next_step -> Nullable<Text>,
        frontier_step -> Nullable<Text>,
        percentage_completed -> Double,
        order_epoch -> BigInt,
        version -> BigInt,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::joinable!(roadmap_steps -> careers (career_id));
diesel::joinable!(user_career_progress -> careers (career_id));

diesel::allow_tables_to_appear_in_same_query!(careers, roadmap_steps, user_career_progress);
