pub mod web_fetch;
pub mod web_search;
