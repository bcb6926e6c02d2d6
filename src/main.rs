use std::{ffi::OsString, process::ExitCode};

use anyhow::{anyhow, bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::debug;
use rcstamp::{
    constants::{VS_FILE_VERSION, VS_PRODUCT_VERSION},
    parse_version_string,
    ResourceUpdater,
};

/// Single-dash aliases that clap can not express as long flags.
const ALIASES: [(&str, &str); 4] = [
    ("-svs", "--set-version-string"),
    ("-sfv", "--set-file-version"),
    ("-spv", "--set-product-version"),
    ("-si", "--set-icon"),
];

#[derive(Debug, Clone, Eq, PartialEq)]
enum Operation {
    SetVersionString(String, String),
    SetFileVersion(String, [u16; 4]),
    SetProductVersion(String, [u16; 4]),
    SetIcon(String),
    SetResourceString(u32, String),
    GetVersionString(String),
    GetResourceString(u32),
}

impl Operation {
    fn modifies(&self) -> bool {
        !matches!(self, Operation::GetVersionString(_) | Operation::GetResourceString(_))
    }
}

/// Number of values following a flag on the command line.
fn value_count(flag: &str) -> usize {
    match flag {
        "--set-version-string" | "--set-resource-string" | "--srs" => 2,
        "--set-file-version" | "--set-product-version" | "--set-icon" | "--get-version-string"
        | "--get-resource-string" => 1,
        _ => 0,
    }
}

fn command() -> Command {
    Command::new("rcstamp")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Stamp version information, icons and strings into Windows executables")
        .arg(Arg::new("file").required(true).value_name("FILE").help("Executable or library to modify"))
        .arg(
            Arg::new("set-version-string")
                .long("set-version-string")
                .num_args(2)
                .value_names(["KEY", "VALUE"])
                .allow_hyphen_values(true)
                .action(ArgAction::Append)
                .help("Set a version string [alias: -svs]"),
        )
        .arg(
            Arg::new("set-file-version")
                .long("set-file-version")
                .value_name("VERSION")
                .action(ArgAction::Append)
                .help("Set the file version and the FileVersion string [alias: -sfv]"),
        )
        .arg(
            Arg::new("set-product-version")
                .long("set-product-version")
                .value_name("VERSION")
                .action(ArgAction::Append)
                .help("Set the product version and the ProductVersion string [alias: -spv]"),
        )
        .arg(
            Arg::new("set-icon")
                .long("set-icon")
                .value_name("ICON")
                .action(ArgAction::Append)
                .help(if cfg!(feature = "images") {
                    "Replace the icon with an .ico file or an image [alias: -si]"
                } else {
                    "Replace the icon with an .ico file [alias: -si]"
                }),
        )
        .arg(
            Arg::new("set-resource-string")
                .long("set-resource-string")
                .alias("srs")
                .num_args(2)
                .value_names(["ID", "VALUE"])
                .allow_hyphen_values(true)
                .action(ArgAction::Append)
                .help("Set a string table entry [alias: --srs]"),
        )
        .arg(
            Arg::new("get-version-string")
                .long("get-version-string")
                .value_name("KEY")
                .action(ArgAction::Append)
                .help("Print a version string"),
        )
        .arg(
            Arg::new("get-resource-string")
                .long("get-resource-string")
                .value_name("ID")
                .value_parser(value_parser!(u32))
                .action(ArgAction::Append)
                .help("Print a string table entry"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase log verbosity"),
        )
}

fn normalize_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    let mut values = 0;
    args.into_iter()
        .map(|arg| {
            if values > 0 {
                values -= 1;
                return arg;
            }
            let arg = match ALIASES.iter().find(|(alias, _)| arg.to_str() == Some(*alias)) {
                Some((_, flag)) => OsString::from(*flag),
                None => arg,
            };
            values = arg.to_str().map(value_count).unwrap_or_default();
            arg
        })
        .collect()
}

/// Collect operations of one flag with their position on the command line.
fn collect<F: Fn(&[String]) -> Result<Operation>>(
    matches: &ArgMatches, operations: &mut Vec<(usize, Operation)>, id: &str, values_per_flag: usize,
    operation: F,
) -> Result<()> {
    let (Some(indices), Some(values)) = (matches.indices_of(id), matches.get_raw(id)) else {
        return Ok(());
    };
    let indices = indices.collect::<Vec<_>>();
    let values = values.map(|value| value.to_string_lossy().into_owned()).collect::<Vec<_>>();
    for (indices, values) in indices.chunks(values_per_flag).zip(values.chunks(values_per_flag)) {
        operations.push((indices[0], operation(values)?));
    }
    Ok(())
}

fn parse_version(version: &str) -> Result<[u16; 4]> {
    parse_version_string(version).ok_or_else(|| anyhow!("Unable to parse version string {}", version))
}

fn parse_id(id: &str) -> Result<u32> { id.parse().map_err(|_| anyhow!("Unable to parse id {}", id)) }

fn operations(matches: &ArgMatches) -> Result<Vec<(usize, Operation)>> {
    let mut operations = Vec::new();
    collect(matches, &mut operations, "set-version-string", 2, |values| {
        Ok(Operation::SetVersionString(values[0].clone(), values[1].clone()))
    })?;
    collect(matches, &mut operations, "set-file-version", 1, |values| {
        Ok(Operation::SetFileVersion(values[0].clone(), parse_version(&values[0])?))
    })?;
    collect(matches, &mut operations, "set-product-version", 1, |values| {
        Ok(Operation::SetProductVersion(values[0].clone(), parse_version(&values[0])?))
    })?;
    collect(matches, &mut operations, "set-icon", 1, |values| {
        Ok(Operation::SetIcon(values[0].clone()))
    })?;
    collect(matches, &mut operations, "set-resource-string", 2, |values| {
        Ok(Operation::SetResourceString(parse_id(&values[0])?, values[1].clone()))
    })?;
    collect(matches, &mut operations, "get-version-string", 1, |values| {
        Ok(Operation::GetVersionString(values[0].clone()))
    })?;
    collect(matches, &mut operations, "get-resource-string", 1, |values| {
        Ok(Operation::GetResourceString(parse_id(&values[0])?))
    })?;
    operations.sort_by_key(|(index, _)| *index);
    Ok(operations)
}

/// Lookups alone leave the file untouched.
fn commits(operations: &[(usize, Operation)]) -> bool {
    operations.is_empty() || operations.iter().any(|(_, operation)| operation.modifies())
}

fn apply(updater: &mut ResourceUpdater, operation: &Operation) -> Result<()> {
    match operation {
        Operation::SetVersionString(key, value) => {
            updater.set_version_string(key, value).context("Unable to change version string")?;
        }
        Operation::SetFileVersion(text, version) => {
            updater.set_file_version(*version).context("Unable to change file version")?;
            updater
                .set_version_string(VS_FILE_VERSION, text)
                .context("Unable to change FileVersion string")?;
        }
        Operation::SetProductVersion(text, version) => {
            updater.set_product_version(*version).context("Unable to change product version")?;
            updater
                .set_version_string(VS_PRODUCT_VERSION, text)
                .context("Unable to change ProductVersion string")?;
        }
        Operation::SetIcon(path) => {
            updater.set_icon(path).context("Unable to set icon")?;
        }
        Operation::SetResourceString(id, value) => {
            updater.change_string(*id, value.as_str()).context("Unable to change string")?;
        }
        Operation::GetVersionString(key) => {
            println!("{}", updater.get_version_string(key).context("Unable to get version string")?);
        }
        Operation::GetResourceString(id) => {
            println!("{}", updater.get_string(*id).context("Unable to get string")?);
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let matches = match command().try_get_matches_from(normalize_args(std::env::args_os())) {
        Ok(matches) => matches,
        Err(error) if !error.use_stderr() => error.exit(),
        Err(error) => {
            let message = error.to_string();
            let message = message.lines().next().unwrap_or_default();
            bail!("{}", message.trim_start_matches("error: "));
        }
    };

    let level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let operations = operations(&matches)?;
    let path = matches
        .get_one::<String>("file")
        .ok_or_else(|| anyhow!("You should specify a exe/dll file"))?;
    let mut updater = ResourceUpdater::load(path).context("Unable to load file")?;
    for (index, operation) in &operations {
        debug!("argument {}: {:?}", index, operation);
        apply(&mut updater, operation)?;
    }

    if commits(&operations) {
        updater.commit().context("Unable to commit changes")?;
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Fatal error: {:#}", error);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Vec<Operation>> {
        let args = normalize_args(args.iter().map(OsString::from));
        let matches = command().try_get_matches_from(args)?;
        Ok(operations(&matches)?.into_iter().map(|(_, operation)| operation).collect())
    }

    #[test]
    fn verify_command() { command().debug_assert(); }

    #[test]
    fn operations_in_argument_order() {
        let operations = parse(&[
            "rcstamp",
            "app.exe",
            "--set-file-version",
            "1.2",
            "--set-version-string",
            "CompanyName",
            "Acme",
            "--set-icon",
            "app.ico",
            "--set-resource-string",
            "5",
            "five",
            "--set-file-version",
            "3",
        ])
        .unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::SetFileVersion("1.2".into(), [1, 2, 0, 0]),
                Operation::SetVersionString("CompanyName".into(), "Acme".into()),
                Operation::SetIcon("app.ico".into()),
                Operation::SetResourceString(5, "five".into()),
                Operation::SetFileVersion("3".into(), [3, 0, 0, 0]),
            ],
            "operations are applied in argument order"
        );
    }

    #[test]
    fn short_aliases() {
        let operations = parse(&[
            "rcstamp",
            "app.exe",
            "-svs",
            "CompanyName",
            "Acme",
            "-sfv",
            "1.2.3.4",
            "-spv",
            "5.6",
            "-si",
            "app.ico",
            "--srs",
            "7",
            "seven",
        ])
        .unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::SetVersionString("CompanyName".into(), "Acme".into()),
                Operation::SetFileVersion("1.2.3.4".into(), [1, 2, 3, 4]),
                Operation::SetProductVersion("5.6".into(), [5, 6, 0, 0]),
                Operation::SetIcon("app.ico".into()),
                Operation::SetResourceString(7, "seven".into()),
            ],
            "aliases map to their long flags"
        );
    }

    #[test]
    fn values_equal_to_aliases_are_kept() {
        let args = ["rcstamp", "app.exe", "--set-version-string", "Comments", "-si", "-svs", "-sfv", "-spv"];
        assert_eq!(
            normalize_args(args.iter().map(OsString::from)),
            ["rcstamp", "app.exe", "--set-version-string", "Comments", "-si", "--set-version-string", "-sfv", "-spv"]
                .iter()
                .map(OsString::from)
                .collect::<Vec<_>>(),
            "only flags are rewritten"
        );
        assert_eq!(
            parse(&args).unwrap(),
            vec![
                Operation::SetVersionString("Comments".into(), "-si".into()),
                Operation::SetVersionString("-sfv".into(), "-spv".into()),
            ],
            "alias values are kept as values"
        );
    }

    #[test]
    fn reject_invalid_arguments() {
        assert!(parse(&["rcstamp", "first.exe", "second.exe"]).is_err(), "second file is rejected");
        assert!(parse(&["rcstamp", "-sfv", "1.2"]).is_err(), "file is required");
        assert!(parse(&["rcstamp", "app.exe", "-sfv", "1.2.3.4.5"]).is_err(), "five version components are rejected");
        assert!(parse(&["rcstamp", "app.exe", "-spv", "1.x"]).is_err(), "non-numeric version is rejected");
        assert!(parse(&["rcstamp", "app.exe", "--srs", "x", "value"]).is_err(), "non-numeric id is rejected");
        assert!(parse(&["rcstamp", "app.exe", "-svs", "Comments"]).is_err(), "missing value is rejected");
    }

    #[test]
    fn lookups_do_not_commit() {
        let lookups = parse(&["rcstamp", "app.exe", "--get-version-string", "CompanyName", "--get-resource-string", "5"])
            .unwrap()
            .into_iter()
            .enumerate()
            .collect::<Vec<_>>();
        assert!(!commits(&lookups), "lookups alone do not commit");

        let mixed = parse(&["rcstamp", "app.exe", "--get-version-string", "CompanyName", "-svs", "Comments", "x"])
            .unwrap()
            .into_iter()
            .enumerate()
            .collect::<Vec<_>>();
        assert!(commits(&mixed), "modifications commit");
        assert!(commits(&[]), "a run without operations commits");
    }
}
