use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use toml::{Table, Value};
use tracing::debug;

use crate::{error::ConfigError, power::PowerModule};

/// longest allowed interval between cycles (two days)
pub const MAX_INTERVAL_MINUTES: u32 = 2880;
/// largest number of cycles in a single run
pub const MAX_SCANS: u32 = 9999;
/// longest allowed initial delay
pub const MAX_DELAY_MINUTES: u32 = 9999;
/// highest outlet index any supported power strip exposes
pub const MAX_OUTLET: u8 = 16;

/// parameters of a scanning run, fixed once the run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    /// last name of the investigator
    pub user: String,
    /// name of the experiment
    pub experiment: String,
    /// minutes to wait after one cycle powers off before the next one starts
    pub interval: u32,
    /// total number of cycles
    pub nscans: u32,
    /// minutes to wait before the first cycle
    #[serde(default)]
    pub delay: u32,
}

impl Display for RunSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "user = {}", self.user)?;
        writeln!(f, "experiment = {}", self.experiment)?;
        writeln!(f, "interval = {}", self.interval)?;
        writeln!(f, "nscans = {}", self.nscans)?;
        writeln!(f, "delay = {}", self.delay)
    }
}

/// device options, passed through to the scanner untouched
///
/// Keys keep the order in which they appear in the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScannerSettings(Table);

impl ScannerSettings {
    pub fn new(options: Table) -> Self {
        ScannerSettings(options)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// option pairs rendered as plain strings, `mode` first
    ///
    /// Scanner backends only expose some options after the mode has been set,
    /// so the mode always goes out ahead of everything else.
    pub fn options(&self) -> Vec<(String, String)> {
        let mut options: Vec<(String, String)> = Vec::with_capacity(self.0.len());
        if let Some(mode) = self.0.get("mode") {
            options.push(("mode".to_string(), render_value(mode)));
        }
        options.extend(
            self.0
                .iter()
                .filter(|(key, _)| key.as_str() != "mode")
                .map(|(key, value)| (key.clone(), render_value(value))),
        );
        options
    }
}

impl Display for ScannerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.0.iter() {
            writeln!(f, "{} = {}", key, render_value(value))?;
        }
        Ok(())
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// how to reach the outlet feeding the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerSettings {
    /// which power controller implementation to use
    pub module: PowerModule,
    /// network address or port of the power manager
    pub address: String,
    #[serde(default, alias = "user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// outlet the scanner is plugged into (1 based)
    pub outlet: u8,
    /// external power manager program, required by the `command` module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
}

impl Display for PowerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module = {}", self.module)?;
        writeln!(f, "address = {}", self.address)?;
        writeln!(f, "username = {}", self.username)?;
        // never echo credentials into reports
        if self.password.is_empty() {
            writeln!(f, "password = ")?;
        } else {
            writeln!(f, "password = ****")?;
        }
        writeln!(f, "outlet = {}", self.outlet)?;
        if let Some(program) = &self.program {
            writeln!(f, "program = {}", program.display())?;
        }
        Ok(())
    }
}

/// the complete contents of a settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub run: RunSettings,
    pub scanner: ScannerSettings,
    pub power: PowerSettings,
}

impl Settings {
    /// read and validate a TOML settings file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("loading settings from {}", path.display());
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// range checks serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        if run.interval < 1 || run.interval > MAX_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid {
                field: "run.interval",
                reason: format!(
                    "{} is outside 1..={} minutes",
                    run.interval, MAX_INTERVAL_MINUTES
                ),
            });
        }
        if run.nscans > MAX_SCANS {
            return Err(ConfigError::Invalid {
                field: "run.nscans",
                reason: format!("{} is larger than {}", run.nscans, MAX_SCANS),
            });
        }
        if run.delay > MAX_DELAY_MINUTES {
            return Err(ConfigError::Invalid {
                field: "run.delay",
                reason: format!("{} is larger than {} minutes", run.delay, MAX_DELAY_MINUTES),
            });
        }
        let power = &self.power;
        if power.outlet < 1 || power.outlet > MAX_OUTLET {
            return Err(ConfigError::Invalid {
                field: "power.outlet",
                reason: format!("{} is outside 1..={}", power.outlet, MAX_OUTLET),
            });
        }
        if power.module == PowerModule::Command && power.program.is_none() {
            return Err(ConfigError::Invalid {
                field: "power.program",
                reason: String::from("the command power module needs a program to run"),
            });
        }
        Ok(())
    }

    /// all three records, grouped under underlined headings
    pub fn summary(&self) -> String {
        let mut s = String::from("SETTINGS:\n\n");
        for (title, body) in [
            ("Run settings", self.run.to_string()),
            ("Scanner settings", self.scanner.to_string()),
            ("Power settings", self.power.to_string()),
        ] {
            s.push_str(title);
            s.push('\n');
            s.push_str(&"=".repeat(title.len()));
            s.push('\n');
            s.push_str(&body);
            s.push('\n');
        }
        s.truncate(s.trim_end().len());
        s.push('\n');
        s
    }

    /// a settings file with sensible defaults, used as a starting point
    pub fn template() -> Self {
        let mut scanner = Table::new();
        scanner.insert("mode".into(), Value::String("Gray".into()));
        scanner.insert("source".into(), Value::String("TPU8x10".into()));
        scanner.insert("resolution".into(), Value::Integer(300));
        scanner.insert("depth".into(), Value::Integer(16));
        Settings {
            run: RunSettings {
                user: String::from("investigator"),
                experiment: String::from("experiment"),
                interval: 30,
                nscans: 1,
                delay: 0,
            },
            scanner: ScannerSettings::new(scanner),
            power: PowerSettings {
                module: PowerModule::Null,
                address: String::from("192.168.1.100"),
                username: String::from("admin"),
                password: String::from("admin"),
                outlet: 1,
                program: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;

    use super::*;

    const SAMPLE: &str = r#"
[run]
user = "smith"
experiment = "germination"
interval = 30
nscans = 48
delay = 5

[scanner]
mode = "Gray"
source = "TPU8x10"
resolution = 300
depth = 16

[power]
module = "null"
address = "192.168.1.100"
username = "admin"
password = "secret"
outlet = 3
"#;

    #[test]
    fn test_parse_sample() -> Result<()> {
        let settings = Settings::from_toml_str(SAMPLE)?;
        assert_eq!(settings.run.user, "smith");
        assert_eq!(settings.run.interval, 30);
        assert_eq!(settings.run.nscans, 48);
        assert_eq!(settings.run.delay, 5);
        assert_eq!(settings.power.outlet, 3);
        assert_eq!(settings.power.module, PowerModule::Null);
        assert_eq!(
            settings.scanner.get("resolution"),
            Some(&Value::Integer(300))
        );
        Ok(())
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(SAMPLE.as_bytes())?;
        let settings = Settings::load(file.path())?;
        assert_eq!(settings.run.experiment, "germination");
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/unscanny.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_delay_defaults_to_zero() -> Result<()> {
        let raw = SAMPLE.replace("delay = 5\n", "");
        let settings = Settings::from_toml_str(&raw)?;
        assert_eq!(settings.run.delay, 0);
        Ok(())
    }

    #[test]
    fn test_missing_section() {
        let raw = SAMPLE.replace("[scanner]", "[scanner_settings]");
        assert!(matches!(
            Settings::from_toml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_field() {
        let raw = SAMPLE.replace("nscans = 48\n", "");
        assert!(matches!(
            Settings::from_toml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_wrong_type() {
        let raw = SAMPLE.replace("interval = 30", "interval = \"thirty\"");
        assert!(matches!(
            Settings::from_toml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let raw = SAMPLE.replace("delay = 5", "delay = 5\ncolour = \"blue\"");
        assert!(matches!(
            Settings::from_toml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let raw = SAMPLE.replace("interval = 30", "interval = 0");
        match Settings::from_toml_str(&raw) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "run.interval"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_outlet_out_of_range() {
        let raw = SAMPLE.replace("outlet = 3", "outlet = 0");
        assert!(matches!(
            Settings::from_toml_str(&raw),
            Err(ConfigError::Invalid { field: "power.outlet", .. })
        ));
    }

    #[test]
    fn test_command_module_needs_program() -> Result<()> {
        let raw = SAMPLE.replace("module = \"null\"", "module = \"command\"");
        assert!(matches!(
            Settings::from_toml_str(&raw),
            Err(ConfigError::Invalid { field: "power.program", .. })
        ));
        let raw = raw.replace("outlet = 3", "outlet = 3\nprogram = \"/usr/local/bin/powermanager\"");
        let settings = Settings::from_toml_str(&raw)?;
        assert_eq!(
            settings.power.program,
            Some(PathBuf::from("/usr/local/bin/powermanager"))
        );
        Ok(())
    }

    #[test]
    fn test_user_alias_for_username() -> Result<()> {
        let raw = SAMPLE.replace("username = \"admin\"", "user = \"operator\"");
        let settings = Settings::from_toml_str(&raw)?;
        assert_eq!(settings.power.username, "operator");
        Ok(())
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let settings = Settings::from_toml_str(SAMPLE)?;
        let reloaded = Settings::from_toml_str(&settings.to_toml_string()?)?;
        assert_eq!(settings, reloaded);
        let template = Settings::template();
        assert_eq!(Settings::from_toml_str(&template.to_toml_string()?)?, template);
        Ok(())
    }

    #[test]
    fn test_display_preserves_order() -> Result<()> {
        let settings = Settings::from_toml_str(SAMPLE)?;
        assert_eq!(
            settings.run.to_string(),
            "user = smith\nexperiment = germination\ninterval = 30\nnscans = 48\ndelay = 5\n"
        );
        assert_eq!(
            settings.scanner.to_string(),
            "mode = Gray\nsource = TPU8x10\nresolution = 300\ndepth = 16\n"
        );
        assert!(settings.power.to_string().contains("password = ****\n"));
        Ok(())
    }

    #[test]
    fn test_options_put_mode_first() -> Result<()> {
        let raw = SAMPLE.replace(
            "mode = \"Gray\"\nsource = \"TPU8x10\"",
            "source = \"TPU8x10\"\nmode = \"Color\"",
        );
        let settings = Settings::from_toml_str(&raw)?;
        let options = settings.scanner.options();
        assert_eq!(options[0], ("mode".to_string(), "Color".to_string()));
        assert_eq!(options[1], ("source".to_string(), "TPU8x10".to_string()));
        assert_eq!(options.len(), 4);
        Ok(())
    }

    #[test]
    fn test_summary_layout() -> Result<()> {
        let summary = Settings::from_toml_str(SAMPLE)?.summary();
        assert!(summary.starts_with("SETTINGS:\n\nRun settings\n============\nuser = smith\n"));
        assert!(summary.contains("\nScanner settings\n================\nmode = Gray\n"));
        assert!(summary.ends_with("outlet = 3\n"));
        Ok(())
    }
}
