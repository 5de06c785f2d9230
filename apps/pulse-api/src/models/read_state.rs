use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::read_states;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = read_states)]
pub struct ReadState {
    pub user_id: String,
    pub conversation_id: String,
    pub last_read_message_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = read_states)]
pub struct NewReadState<'a> {
    pub user_id: &'a str,
    pub conversation_id: &'a str,
    pub last_read_message_id: &'a str,
    pub updated_at: DateTime<Utc>,
}
