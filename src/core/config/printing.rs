use std::path::Path;

use crate::core::config::data::{path_display, Config};
use crate::core::config::settings::SETTING_KEYS;

impl Config {
    pub fn print_all(&self, path: &Path) {
        println!("Current configuration ({}):", path_display(path));
        for key in SETTING_KEYS {
            println!("  {key}: {}", self.format_value(key));
        }
    }
}
