use std::path::PathBuf;

use fiskc::args::{CompilerArgs, Language, LocalReason};
use fiskc::compiler::{CompilerInfo, CompilerKind};
use fiskc::fingerprint::Fingerprint;

fn gcc() -> CompilerInfo {
    CompilerInfo {
        compiler: PathBuf::from("/usr/bin/gcc"),
        resolved: PathBuf::from("/usr/bin/gcc"),
        builder_compiler: "/usr/bin/gcc".to_string(),
        kind: CompilerKind::Gcc,
    }
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn classify(args: &[&str]) -> Result<CompilerArgs, LocalReason> {
    CompilerArgs::parse(&gcc(), Some(12), argv(args), true, false, None, None)
}

/// Every remotable command line must end up with exactly one source file,
/// `-c`, an output path, and a compilable (non-assembler) language.
#[test]
fn remote_invariants_hold() {
    let remotable: &[&[&str]] = &[
        &["gcc", "-c", "foo.cpp", "-o", "foo.o", "-I", "inc"],
        &["gcc", "-c", "src/bar.c"],
        &["gcc", "-O2", "-Wall", "-c", "baz.cc", "-o", "out/baz.o"],
        &["gcc", "-c", "-x", "c++", "legacy.c", "-o", "legacy.o"],
        &["gcc", "-MD", "-c", "dep.c", "-o", "dep.o"],
        &["gcc", "-c", "pre.ii", "-o", "pre.o"],
    ];
    for args in remotable {
        let parsed = classify(args).unwrap_or_else(|r| panic!("{args:?} -> {r:?}"));
        let positionals = parsed
            .command_line
            .iter()
            .enumerate()
            .filter(|(i, a)| *i == parsed.source_file_index && !a.starts_with('-'))
            .count();
        assert_eq!(positionals, 1);
        assert!(parsed.command_line.iter().any(|a| a == "-c"));
        assert!(!parsed.output().is_empty());
        assert_ne!(parsed.language, Language::Assembler);
        assert_ne!(parsed.language, Language::AssemblerWithCpp);
    }
}

#[test]
fn local_rejections_name_their_reason() {
    let local: &[(&[&str], LocalReason)] = &[
        (&["gcc", "foo.o", "bar.o", "-o", "app"], LocalReason::Link),
        (&["gcc", "-E", "foo.c"], LocalReason::Preprocess),
        (&["gcc", "-S", "-c", "foo.c"], LocalReason::DoNotAssemble),
        (&["gcc", "-c", "foo.c", "-o", "-"], LocalReason::StdOutOutput),
        (&["gcc", "-c", "-"], LocalReason::StdinInput),
        (&["gcc", "-c"], LocalReason::NoSources),
        (&["gcc", "-c", "-march=native", "foo.c"], LocalReason::NativeArch),
        (&["gcc", "-c", "-B/tools", "foo.c"], LocalReason::BinPath),
        (
            &["gcc", "-c", "-fsanitize-blacklist=deny.txt", "foo.c"],
            LocalReason::ExtraFiles,
        ),
        (&["gcc", "-c", "a.c", "b.c"], LocalReason::MultiSource),
    ];
    for (args, expected) in local {
        assert_eq!(classify(args).unwrap_err(), *expected, "{args:?}");
    }
}

#[test]
fn fingerprint_is_stable_for_identical_jobs() {
    let run = || {
        let mut fp = Fingerprint::new();
        CompilerArgs::parse(
            &gcc(),
            Some(12),
            argv(&["gcc", "-c", "foo.c", "-o", "foo.o", "-DX=1", "-O2"]),
            true,
            false,
            None,
            Some(&mut fp),
        )
        .unwrap();
        fp.update_preprocessed(b"# 1 \"foo.c\"\nint main() { return 0; }\n");
        fp.update("env-hash");
        fp.finish_hex()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first.len(), 40);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}
