use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, ImageFormat};
use regex::{Regex, RegexBuilder};
use toml::{Table, Value};
use tracing::{debug, trace};

use crate::{error::ConfigError, settings::ScannerSettings};

/// pattern used to find the scanner when none is given
pub const DEFAULT_DEVICE_PATTERN: &str = "epson";
/// name of the SANE test backend device
pub const TEST_DEVICE: &str = "test";

/// case-insensitive regular expression matched anywhere in a device name
#[derive(Debug, Clone)]
pub struct DevicePattern {
    regex: Regex,
}

impl DevicePattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(DevicePattern { regex })
    }

    pub fn matches(&self, device: &str) -> bool {
        self.regex.is_match(device)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

/// a scanner driver
///
/// Handles are owned by the caller for the duration of one capture, so no
/// driver state outlives the cycle that opened it.
pub trait ScanDevice {
    type Handle;

    /// names of attached devices matching `pattern`
    fn list_devices(&mut self, pattern: &DevicePattern) -> Result<Vec<String>>;
    fn open(&mut self, device: &str) -> Result<Self::Handle>;
    fn configure(&mut self, handle: &mut Self::Handle, settings: &ScannerSettings) -> Result<()>;
    /// acquire one frame, blocks for the duration of the scan
    fn capture(&mut self, handle: &mut Self::Handle) -> Result<DynamicImage>;
    fn close(&mut self, handle: Self::Handle) -> Result<()>;
}

/// command for an external driver program, outside the terminal's process group
///
/// Ctrl-C then only reaches this process, which finishes the running step and
/// stops cleanly instead of having the scan or outlet command killed under it.
pub(crate) fn driver_command(program: &Path) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// settings understood by the SANE test backend
pub fn test_settings() -> ScannerSettings {
    let mut options = Table::new();
    options.insert("source".into(), Value::String("Flatbed".into()));
    options.insert("test_picture".into(), Value::String("Color pattern".into()));
    options.insert("mode".into(), Value::String("Color".into()));
    options.insert("resolution".into(), Value::Integer(75));
    options.insert("depth".into(), Value::Integer(8));
    ScannerSettings::new(options)
}

/// open device as seen by the `scanimage` driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanimageHandle {
    device: String,
    options: Vec<(String, String)>,
}

/// scanner driven through the SANE `scanimage` command line tool
#[derive(Debug, Clone)]
pub struct ScanimageDevice {
    program: PathBuf,
    test_backend: bool,
}

impl Default for ScanimageDevice {
    fn default() -> Self {
        ScanimageDevice {
            program: PathBuf::from("scanimage"),
            test_backend: false,
        }
    }
}

impl ScanimageDevice {
    pub fn new(program: PathBuf) -> Self {
        ScanimageDevice {
            program,
            test_backend: false,
        }
    }

    /// use the SANE test backend instead of real hardware
    ///
    /// The test device is not always enumerated by SANE, so it is reported
    /// without asking the driver.
    pub fn test_backend() -> Self {
        ScanimageDevice {
            test_backend: true,
            ..Default::default()
        }
    }

    fn capture_args(handle: &ScanimageHandle) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-d".into(),
            handle.device.clone().into(),
            "--format=tiff".into(),
        ];
        for (key, value) in &handle.options {
            args.push(format!("--{}", key.replace('_', "-")).into());
            args.push(value.clone().into());
        }
        args
    }
}

/// the lines of `scanimage -f '%d%n'` output that match `pattern`
pub fn parse_device_list(output: &str, pattern: &DevicePattern) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && pattern.matches(line))
        .map(String::from)
        .collect()
}

impl ScanDevice for ScanimageDevice {
    type Handle = ScanimageHandle;

    fn list_devices(&mut self, pattern: &DevicePattern) -> Result<Vec<String>> {
        if self.test_backend {
            return Ok(parse_device_list(TEST_DEVICE, pattern));
        }
        let out = driver_command(&self.program)
            .args(["-f", "%d%n"])
            .output()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "device enumeration exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        let devices = parse_device_list(&String::from_utf8_lossy(&out.stdout), pattern);
        debug!("{} device(s) match '{}'", devices.len(), pattern.as_str());
        Ok(devices)
    }

    fn open(&mut self, device: &str) -> Result<Self::Handle> {
        Ok(ScanimageHandle {
            device: device.to_string(),
            options: Vec::new(),
        })
    }

    fn configure(&mut self, handle: &mut Self::Handle, settings: &ScannerSettings) -> Result<()> {
        handle.options = settings.options();
        trace!("options for {}: {:?}", handle.device, handle.options);
        Ok(())
    }

    fn capture(&mut self, handle: &mut Self::Handle) -> Result<DynamicImage> {
        let args = Self::capture_args(handle);
        debug!("running {} {:?}", self.program.display(), args);
        let out = driver_command(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "scan on {} exited with {}: {}",
                handle.device,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        if out.stdout.is_empty() {
            return Err(anyhow!("scan on {} returned no image data", handle.device));
        }
        image::load_from_memory_with_format(&out.stdout, ImageFormat::Tiff)
            .with_context(|| format!("failed to decode image from {}", handle.device))
    }

    fn close(&mut self, handle: Self::Handle) -> Result<()> {
        trace!("closing {}", handle.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "epson2:libusb:001:004\nv4l:/dev/video0\n\nEPSON:net:192.168.1.50\n";

    #[test]
    fn test_pattern_is_case_insensitive_substring() -> Result<()> {
        let pattern = DevicePattern::new("epson")?;
        assert!(pattern.matches("epson2:libusb:001:004"));
        assert!(pattern.matches("EPSON:net:192.168.1.50"));
        assert!(pattern.matches("net:EpSoN"));
        assert!(!pattern.matches("v4l:/dev/video0"));
        Ok(())
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(
            DevicePattern::new("epson("),
            Err(ConfigError::Pattern { .. })
        ));
    }

    #[test]
    fn test_parse_device_list() -> Result<()> {
        let pattern = DevicePattern::new("^epson")?;
        assert_eq!(
            parse_device_list(LISTING, &pattern),
            vec!["epson2:libusb:001:004", "EPSON:net:192.168.1.50"]
        );
        let pattern = DevicePattern::new("canon")?;
        assert!(parse_device_list(LISTING, &pattern).is_empty());
        Ok(())
    }

    #[test]
    fn test_test_backend_lists_test_device() -> Result<()> {
        let mut device = ScanimageDevice::test_backend();
        assert_eq!(device.list_devices(&DevicePattern::new("test")?)?, vec!["test"]);
        assert!(device.list_devices(&DevicePattern::new("epson")?)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_capture_args_from_settings() -> Result<()> {
        let mut device = ScanimageDevice::test_backend();
        let mut handle = device.open(TEST_DEVICE)?;
        device.configure(&mut handle, &test_settings())?;
        let args: Vec<String> = ScanimageDevice::capture_args(&handle)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-d",
                "test",
                "--format=tiff",
                "--mode",
                "Color",
                "--source",
                "Flatbed",
                "--test-picture",
                "Color pattern",
                "--resolution",
                "75",
                "--depth",
                "8",
            ]
        );
        device.close(handle)?;
        Ok(())
    }

    #[test]
    fn test_missing_driver() -> Result<()> {
        let mut device = ScanimageDevice::new(PathBuf::from("/nonexistent/scanimage"));
        assert!(device.list_devices(&DevicePattern::new("epson")?).is_err());
        Ok(())
    }
}
