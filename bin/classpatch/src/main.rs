mod error;

use classpatch::jvm::class_file::ClassFile;
use classpatch::pipeline::{RuleOutcome, Settings, Transformed, Transformer};

use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use error::CliError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use walkdir::WalkDir;

fn main() -> Result<(), CliError> {
    env_logger::init();

    let matches = Command::new("JVM class patcher")
        .version(crate_version!())
        .author("Alec Theriault <alec.theriault@gmail.com>")
        .about("Apply the built-in method patches to compiled JVM classes")
        .arg(
            Arg::new("input")
                .long("input")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("list-rules")
                .help("Class file, or directory of class files, to patch"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("list-rules")
                .help("Where to write the patched class (or directory)"),
        )
        .arg(
            Arg::new("class-name")
                .long("class-name")
                .value_name("CLASS_NAME")
                .help("Name of the input class (eg. `foo.bar.Baz`), read from the class if missing"),
        )
        .arg(
            Arg::new("list-rules")
                .long("list-rules")
                .action(ArgAction::SetTrue)
                .help("Print the built-in rules and exit"),
        )
        .arg(
            Arg::new("max-code-length")
                .long("max-code-length")
                .value_name("BYTES")
                .value_parser(value_parser!(usize))
                .default_value("65535")
                .help("Reject patched methods with more bytecode than this"),
        )
        .arg(
            Arg::new("log-sizes")
                .long("log-sizes")
                .action(ArgAction::SetTrue)
                .help("Log class sizes before and after patching"),
        )
        .arg(
            Arg::new("lenient")
                .long("lenient-class-name")
                .action(ArgAction::SetTrue)
                .help("Patch classes even when the supplied name differs from the one inside"),
        )
        .get_matches();

    let defaults = Settings::default();
    let settings = Settings {
        max_code_length: matches
            .get_one::<usize>("max-code-length")
            .copied()
            .unwrap_or(defaults.max_code_length),
        log_sizes: matches.get_flag("log-sizes"),
        strict_class_name: !matches.get_flag("lenient"),
    };
    let transformer = Transformer::with_builtin_rules(settings);

    if matches.get_flag("list-rules") {
        list_rules(&transformer)?;
        return Ok(());
    }

    let (input, output) = match (
        matches.get_one::<PathBuf>("input"),
        matches.get_one::<PathBuf>("output"),
    ) {
        (Some(input), Some(output)) => (input, output),
        _ => return Ok(()),
    };
    let class_name = matches.get_one::<String>("class-name");

    // Pairs of input class and where its output goes
    let classes = if input.is_dir() {
        if class_name.is_some() {
            return Err(CliError::ClassNameForDirectory);
        }
        if output.is_file() {
            return Err(CliError::OutputNotADirectory(output.clone()));
        }
        directory_classes(input, output)?
    } else {
        let bytes = fs::read(input)?;
        let name = match class_name {
            Some(name) => name.clone(),
            None => class_name_of(&bytes).unwrap_or_default(),
        };
        vec![(name, input.clone(), output.clone())]
    };

    let stdout = StandardStream::stdout(ColorChoice::Auto);
    let mut failed_rules = 0;
    for (name, source, destination) in classes {
        log::info!("Patching '{}'", source.display());
        let bytes = fs::read(&source)?;
        let transformed = transformer.transform_with_report(&name, &bytes);
        failed_rules += transformed
            .outcomes
            .iter()
            .filter(|report| matches!(report.outcome, RuleOutcome::Failed(_)))
            .count();
        fs::write(&destination, &transformed.bytes)?;
        report(&mut stdout.lock(), &name, &transformed)?;
    }

    exit(if failed_rules > 0 { 1 } else { 0 })
}

/// Classes under an input directory, each paired with where its output goes
///
/// Files that are not classes are copied over as they are.
fn directory_classes(
    input: &Path,
    output: &Path,
) -> Result<Vec<(String, PathBuf, PathBuf)>, CliError> {
    let mut classes = vec![];
    for entry in WalkDir::new(input).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let relative = match path.strip_prefix(input) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        let destination = output.join(&relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.extension().map_or(false, |ext| ext == "class") {
            let name = class_name_from_path(&relative)?;
            classes.push((name, path, destination));
        } else {
            fs::copy(&path, &destination)?;
        }
    }
    Ok(classes)
}

/// Binary name of a class stored at a path relative to a classpath root
fn class_name_from_path(relative: &Path) -> Result<String, CliError> {
    let stem = relative.with_extension("");
    let mut parts = vec![];
    for component in stem.components() {
        match component.as_os_str().to_str() {
            Some(part) => parts.push(part),
            None => return Err(CliError::NotAClassPath(relative.to_path_buf())),
        }
    }
    Ok(parts.join("/"))
}

fn class_name_of(bytes: &[u8]) -> Option<String> {
    ClassFile::parse(bytes).ok()?.name().ok().map(str::to_owned)
}

fn list_rules(transformer: &Transformer) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for rule in transformer.rules().iter() {
        writeln!(
            out,
            "{:>5}  {:<15}  {}\n       {}",
            rule.priority,
            rule.strategy.kind(),
            rule.target,
            rule.description
        )?;
    }
    Ok(())
}

/// One line per class, plus one per rule that targeted it
fn report<W: WriteColor>(out: &mut W, name: &str, transformed: &Transformed) -> io::Result<()> {
    let (color, summary) = if transformed.rejected.is_some() {
        (Color::Yellow, "REJECTED")
    } else if transformed.changed() {
        (Color::Green, "PATCHED")
    } else {
        (Color::White, "UNCHANGED")
    };

    out.write_all(b" - ")?;
    out.set_color(ColorSpec::new().set_bold(true))?;
    write!(out, "{}", name)?;
    out.set_color(ColorSpec::new().set_dimmed(true))?;
    out.write_all(b" [")?;
    out.set_color(ColorSpec::new().set_fg(Some(color)))?;
    out.write_all(summary.as_bytes())?;
    out.set_color(ColorSpec::new().set_dimmed(true))?;
    out.write_all(b"]\n")?;

    for rule in &transformed.outcomes {
        let (color, outcome) = match &rule.outcome {
            RuleOutcome::NoMatch => (Color::White, "no match"),
            RuleOutcome::Unchanged => (Color::White, "unchanged"),
            RuleOutcome::Applied => (Color::Green, "applied"),
            RuleOutcome::Failed(_) => (Color::Red, "failed"),
        };
        out.set_color(ColorSpec::new().set_dimmed(true))?;
        write!(out, "     {} ", rule.target)?;
        out.set_color(ColorSpec::new().set_fg(Some(color)))?;
        writeln!(out, "{}", outcome)?;
    }
    out.reset()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn class_names_from_relative_paths() {
        let name = class_name_from_path(Path::new("com/example/World.class")).unwrap();
        assert_eq!(name, "com/example/World");
    }

    #[test]
    fn unreadable_input_directory_is_an_error() {
        let missing = std::env::temp_dir().join("classpatch-missing-input-dir");
        let output = std::env::temp_dir().join("classpatch-missing-output-dir");
        assert!(matches!(
            directory_classes(&missing, &output),
            Err(CliError::Walk(_))
        ));
    }
}
