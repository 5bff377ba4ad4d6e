//! Core domain types shared across the integrator.

mod ids;
mod staged;

pub use ids::{BuildNumber, BuildRef, ProjectId, RequestId, Sha};
pub use staged::{
    StagedChange, format_change_list, format_change_list_html, parse_staging_ls,
};
