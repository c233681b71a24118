//! Single source of truth for column names that may be interpolated into dynamic SQL
//! fragments (spec §7, §9 "Field-name allowlist"). Kept for forward compatibility
//! with any future caller-supplied field map; today every `SET`/`WHERE` fragment in
//! this crate (`ChannelRepo::update_channel`, the log filter/aggregator) builds its
//! column list from typed struct fields chosen by this crate's own code, not a
//! caller-supplied name, so there is currently no call site that needs to consult
//! [`channel_patch_column`].

use crate::error::Error;

const CHANNEL_PATCH_COLUMNS: &[&str] = &[
    "name",
    "url",
    "priority",
    "models",
    "model_redirects",
    "channel_type",
    "enabled",
];

pub fn channel_patch_column(name: &str) -> Result<&'static str, Error> {
    CHANNEL_PATCH_COLUMNS
        .iter()
        .find(|c| **c == name)
        .copied()
        .ok_or_else(|| Error::Validation(format!("unknown channel field `{name}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_columns() {
        assert!(channel_patch_column("priority").is_ok());
    }

    #[test]
    fn rejects_unknown_columns() {
        assert!(channel_patch_column("rr_key_index").is_err());
        assert!(channel_patch_column("api_key_used; DROP TABLE logs;--").is_err());
    }
}
