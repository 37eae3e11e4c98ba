use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    device::driver_command,
    settings::{MAX_OUTLET, PowerSettings},
};

/// switches the outlet a scanner is plugged into
///
/// Implementations talk to real hardware, so every call is a side effect that
/// cannot be taken back. Calls may be repeated; whether repeating is harmless
/// depends on the power manager.
pub trait PowerController {
    /// switch the outlet on
    fn power_on(&mut self, outlet: u8) -> Result<()>;
    /// switch the outlet off
    fn power_off(&mut self, outlet: u8) -> Result<()>;
    /// query whether the outlet is currently on
    fn is_on(&mut self, outlet: u8) -> Result<bool>;
}

/// environment variable carrying the power manager password to the program
pub const PASSWORD_ENV: &str = "UNSCANNY_POWER_PASSWORD";

/// tag selecting a power controller implementation in the settings file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum PowerModule {
    /// no power manager attached, outlet state is only tracked in memory
    Null,
    /// delegate to an external power manager program
    Command,
}

impl Display for PowerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerModule::Null => write!(f, "null"),
            PowerModule::Command => write!(f, "command"),
        }
    }
}

impl FromStr for PowerModule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "null" | "nullpower" => Ok(PowerModule::Null),
            "command" => Ok(PowerModule::Command),
            _ => Err(anyhow!("unknown power module '{}'", s)),
        }
    }
}

impl TryFrom<String> for PowerModule {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// build the power controller named by the settings
///
/// # Examples
///
/// ```
/// use anyhow::Result;
/// use unscanny::power::PowerController;
/// use unscanny::settings::Settings;
///
/// fn main() -> Result<()> {
///     let settings = Settings::template();
///     let mut power = unscanny::power::connect(&settings.power)?;
///     power.power_on(settings.power.outlet)?;
///     assert!(power.is_on(settings.power.outlet)?);
///     Ok(())
/// }
/// ```
pub fn connect(settings: &PowerSettings) -> Result<Box<dyn PowerController>> {
    debug!(
        "using {} power controller at {}",
        settings.module, settings.address
    );
    match settings.module {
        PowerModule::Null => Ok(Box::new(NullPower::default())),
        PowerModule::Command => {
            let program = settings
                .program
                .clone()
                .ok_or_else(|| anyhow!("the command power module needs a program to run"))?;
            Ok(Box::new(CommandPower::new(
                program,
                &settings.address,
                &settings.username,
                &settings.password,
            )))
        }
    }
}

fn check_outlet(outlet: u8) -> Result<usize> {
    if outlet < 1 || outlet > MAX_OUTLET {
        return Err(anyhow!(
            "outlet {} is outside the supported range 1..={}",
            outlet,
            MAX_OUTLET
        ));
    }
    Ok(usize::from(outlet - 1))
}

/// stand-in used when the scanner is not on a switched outlet
#[derive(Debug, Default)]
pub struct NullPower {
    outlets: [bool; MAX_OUTLET as usize],
}

impl PowerController for NullPower {
    fn power_on(&mut self, outlet: u8) -> Result<()> {
        let index = check_outlet(outlet)?;
        trace!("null power: outlet {} on", outlet);
        self.outlets[index] = true;
        Ok(())
    }

    fn power_off(&mut self, outlet: u8) -> Result<()> {
        let index = check_outlet(outlet)?;
        trace!("null power: outlet {} off", outlet);
        self.outlets[index] = false;
        Ok(())
    }

    fn is_on(&mut self, outlet: u8) -> Result<bool> {
        Ok(self.outlets[check_outlet(outlet)?])
    }
}

/// runs an external power manager program for each outlet command
///
/// The program is invoked as
/// `<program> -a <address> -u <username> <action> <outlet>`
/// where action is `power-on`, `power-off` or `is-on`, with the password in
/// the [`PASSWORD_ENV`] environment variable so it never shows up in the
/// process list. A zero exit status means success; `is-on` prints `1` or `0`
/// on stdout.
#[derive(Debug)]
pub struct CommandPower {
    program: PathBuf,
    address: String,
    username: String,
    password: String,
}

impl CommandPower {
    pub fn new(program: PathBuf, address: &str, username: &str, password: &str) -> Self {
        CommandPower {
            program,
            address: address.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn run(&self, action: &str, outlet: u8) -> Result<String> {
        check_outlet(outlet)?;
        let mut cmd = driver_command(&self.program);
        cmd.args([
            "-a",
            self.address.as_str(),
            "-u",
            self.username.as_str(),
            action,
        ]);
        cmd.arg(outlet.to_string());
        cmd.env(PASSWORD_ENV, &self.password);
        debug!(
            "running {} {} {} on {}",
            self.program.display(),
            action,
            outlet,
            self.address
        );
        let out = cmd
            .output()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "{} {} {} exited with {}: {}",
                self.program.display(),
                action,
                outlet,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl PowerController for CommandPower {
    fn power_on(&mut self, outlet: u8) -> Result<()> {
        self.run("power-on", outlet).map(|_| ())
    }

    fn power_off(&mut self, outlet: u8) -> Result<()> {
        self.run("power-off", outlet).map(|_| ())
    }

    fn is_on(&mut self, outlet: u8) -> Result<bool> {
        let reply = self.run("is-on", outlet)?;
        match reply.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(anyhow!("unexpected is-on reply from power manager: '{}'", reply)),
        }
    }
}
