pub mod cli_models;
pub mod overlay_compose_yaml;
pub mod settings;

pub const OVERLAY_SETTINGS_FOLDER: &str = "/etc/overlay-compose/";
