use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use vocalmidi_core::Config;
use vocalmidi_core::pipeline::Control;

#[derive(Parser, Debug)]
#[command(name = "vocalmidi", about = "Turns a sung or played monophonic voice into live MIDI")]
pub struct Cli {
    /// JSON config file (camelCase keys; missing keys use defaults)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// MIDI output port name, or a substring of it
    #[arg(short, long)]
    pub port: Option<String>,

    /// List MIDI output ports and exit
    #[arg(long)]
    pub list_ports: bool,

    /// List audio input devices and exit
    #[arg(long)]
    pub list_inputs: bool,

    /// MIDI channel (0-15), overrides the config file
    #[arg(short, long)]
    pub channel: Option<u8>,

    /// Octaves added to every note (-3 to 3), overrides the config file
    #[arg(long, allow_hyphen_values = true)]
    pub octave_shift: Option<i8>,

    /// Input sensitivity in percent (0-100), overrides the config file
    #[arg(short, long)]
    pub sensitivity: Option<f32>,

    /// Send every note at the base velocity instead of deriving it from the input level
    #[arg(long)]
    pub fixed_velocity: bool,

    /// Record played notes and save them to this JSON file on exit
    #[arg(short, long)]
    pub record: Option<PathBuf>,

    /// Write the default config to this file and exit
    #[arg(long)]
    pub write_default_config: Option<PathBuf>,
}

impl Cli {
    /// The config file (or defaults) with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let config = Config::load_from_file(path)?;
                log::info!("Loaded config from {}", path.display());
                config
            }
            None => Config::default(),
        };
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
        if let Some(octave_shift) = self.octave_shift {
            config.octave_shift = octave_shift;
        }
        if let Some(sensitivity) = self.sensitivity {
            config.sensitivity = sensitivity;
        }
        if self.fixed_velocity {
            config.velocity_from_amplitude = false;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Help shown for the interactive commands.
pub const COMMANDS_HELP: &str =
    "Enter: stop | p: panic | o <n>: octave shift | c <n>: channel | s <0-100>: sensitivity";

/// Parses one line typed while the pipeline runs.
pub fn parse_command(line: &str) -> Result<Control> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(Control::Stop);
    };
    let argument = words.next();
    let control = match (command, argument) {
        ("q" | "quit", None) => Control::Stop,
        ("p" | "panic", None) => Control::Panic,
        ("o" | "octave", Some(value)) => Control::SetOctaveShift(
            value.parse().with_context(|| format!("Bad octave shift '{value}'"))?,
        ),
        ("c" | "channel", Some(value)) => Control::SetChannel(
            value.parse().with_context(|| format!("Bad channel '{value}'"))?,
        ),
        ("s" | "sensitivity", Some(value)) => Control::SetSensitivity(
            value.parse().with_context(|| format!("Bad sensitivity '{value}'"))?,
        ),
        _ => bail!("Unknown command '{}'. {}", line.trim(), COMMANDS_HELP),
    };
    if words.next().is_some() {
        bail!("Too many arguments in '{}'", line.trim());
    }
    Ok(control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_stops() {
        assert_eq!(parse_command("").unwrap(), Control::Stop);
        assert_eq!(parse_command("  \n").unwrap(), Control::Stop);
        assert_eq!(parse_command("quit").unwrap(), Control::Stop);
    }

    #[test]
    fn live_settings_parse() {
        assert_eq!(parse_command("p").unwrap(), Control::Panic);
        assert_eq!(parse_command("o -2").unwrap(), Control::SetOctaveShift(-2));
        assert_eq!(parse_command("channel 9").unwrap(), Control::SetChannel(9));
        assert_eq!(parse_command("s 50").unwrap(), Control::SetSensitivity(50.0));
        assert_eq!(parse_command("sensitivity 12.5").unwrap(), Control::SetSensitivity(12.5));
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(parse_command("o").is_err());
        assert!(parse_command("o up").is_err());
        assert!(parse_command("c 300").is_err());
        assert!(parse_command("panic now").is_err());
        assert!(parse_command("hello").is_err());
    }

    #[test]
    fn flags_override_the_defaults() {
        let cli = Cli::parse_from([
            "vocalmidi",
            "--channel",
            "3",
            "--octave-shift",
            "-1",
            "--fixed-velocity",
            "--sensitivity",
            "85",
        ]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.channel, 3);
        assert_eq!(config.octave_shift, -1);
        assert!(!config.velocity_from_amplitude);
        assert_eq!(config.sensitivity, 85.0);
    }

    #[test]
    fn invalid_overrides_fail_before_starting() {
        let cli = Cli::parse_from(["vocalmidi", "--octave-shift", "5"]);
        assert!(cli.resolve_config().is_err());
        let cli = Cli::parse_from(["vocalmidi", "--sensitivity", "150"]);
        assert!(cli.resolve_config().is_err());
    }
}
