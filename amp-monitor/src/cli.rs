//! Command line arguments

use std::path::PathBuf;
use std::str::FromStr;

use amp_router::{AssignmentTable, DeviceAddress, DisplayChannel, RouterError};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "amp-monitor",
    version,
    about = "Poll networked amplifiers and route their readings to display channels"
)]
pub struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Default device, as host or host:port
    #[arg(short, long)]
    pub device: Option<DeviceAddress>,

    /// Run a virtual amplifier on loopback and use it as the default device
    #[arg(long)]
    pub simulate: bool,

    /// Channel assignment, as channel=host[:port][/physical] (repeatable)
    #[arg(short, long = "assign", value_name = "ASSIGNMENT")]
    pub assignments: Vec<AssignArg>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    pub save: bool,

    /// Print each event as a JSON line on stdout
    #[arg(long)]
    pub json: bool,
}

/// One `--assign` value
///
/// An empty host keeps the channel on the default device, so
/// `input2=/4` only overrides the physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignArg {
    pub channel: DisplayChannel,
    pub address: Option<DeviceAddress>,
    pub physical: Option<u8>,
}

impl AssignArg {
    pub fn apply(&self, table: &mut AssignmentTable) -> Result<(), RouterError> {
        table.set_assignment(self.channel, self.address.clone())?;
        table.set_channel_number(self.channel, self.physical)?;
        Ok(())
    }
}

impl FromStr for AssignArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, target) = s
            .split_once('=')
            .ok_or_else(|| format!("expected channel=host[:port][/physical], got '{}'", s))?;
        let channel: DisplayChannel = channel
            .trim()
            .parse()
            .map_err(|e: RouterError| e.to_string())?;

        let (host, physical) = match target.rsplit_once('/') {
            Some((host, physical)) => {
                let physical = physical
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| format!("invalid physical channel '{}'", physical))?;
                (host.trim(), Some(physical))
            }
            None => (target.trim(), None),
        };

        let address = if host.is_empty() {
            None
        } else {
            Some(host.parse().map_err(|e: RouterError| e.to_string())?)
        };

        Ok(Self {
            channel,
            address,
            physical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_protocol::DEFAULT_PORT;

    #[test]
    fn test_parse_full_assignment() {
        let arg: AssignArg = "input1=10.0.0.5:9000/3".parse().unwrap();
        assert_eq!(arg.channel, DisplayChannel::input(1));
        assert_eq!(arg.address, Some(DeviceAddress::new("10.0.0.5", 9000)));
        assert_eq!(arg.physical, Some(3));
    }

    #[test]
    fn test_parse_host_only_uses_default_port() {
        let arg: AssignArg = "output4=amp-b".parse().unwrap();
        assert_eq!(arg.address, Some(DeviceAddress::new("amp-b", DEFAULT_PORT)));
        assert_eq!(arg.physical, None);
    }

    #[test]
    fn test_parse_physical_only() {
        let arg: AssignArg = "input2=/4".parse().unwrap();
        assert_eq!(arg.address, None);
        assert_eq!(arg.physical, Some(4));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("input1".parse::<AssignArg>().is_err());
        assert!("input9=10.0.0.5".parse::<AssignArg>().is_err());
        assert!("input1=10.0.0.5/x".parse::<AssignArg>().is_err());
    }

    #[test]
    fn test_apply_rejects_bad_physical() {
        let mut table = AssignmentTable::new();
        let arg: AssignArg = "output1=/7".parse().unwrap();
        assert!(matches!(
            arg.apply(&mut table),
            Err(RouterError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_cli_parses_repeated_assignments() {
        let cli = Cli::parse_from([
            "amp-monitor",
            "--device",
            "10.0.0.1",
            "--assign",
            "input1=10.0.0.2",
            "-a",
            "output2=/1",
            "--save",
        ]);
        assert_eq!(cli.device, Some(DeviceAddress::new("10.0.0.1", DEFAULT_PORT)));
        assert_eq!(cli.assignments.len(), 2);
        assert!(cli.save);
        assert!(!cli.simulate);

        let mut table = AssignmentTable::new();
        for arg in &cli.assignments {
            arg.apply(&mut table).unwrap();
        }
        assert_eq!(
            table.owner_of(DisplayChannel::input(1)),
            Some(&DeviceAddress::new("10.0.0.2", DEFAULT_PORT))
        );
        assert_eq!(table.physical_of(DisplayChannel::output(2)), 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parsed_assignment_matches_parts(
                output in any::<bool>(),
                index in 1u8..=4,
                octet in 1u8..=254,
                port in 1u16..,
                physical in prop::option::of(1u8..=4),
            ) {
                let prefix = if output { "output" } else { "input" };
                let mut text = format!("{prefix}{index}=192.168.1.{octet}:{port}");
                if let Some(p) = physical {
                    text.push_str(&format!("/{p}"));
                }

                let arg: AssignArg = text.parse().unwrap();
                let channel = if output {
                    DisplayChannel::output(index)
                } else {
                    DisplayChannel::input(index)
                };
                prop_assert_eq!(arg.channel, channel);
                prop_assert_eq!(
                    arg.address.clone(),
                    Some(DeviceAddress::new(format!("192.168.1.{octet}"), port))
                );
                prop_assert_eq!(arg.physical, physical);

                let mut table = AssignmentTable::new();
                arg.apply(&mut table).unwrap();
                prop_assert_eq!(table.physical_of(channel), physical.unwrap_or(index));
            }
        }
    }
}
