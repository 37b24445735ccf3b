use std::path::Path;

use log::debug;
use path_absolutize::Absolutize;

use crate::compiler::{CompilerInfo, CompilerKind};
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    CPreprocessed,
    CPlusPlus,
    CPlusPlusPreprocessed,
    ObjectiveC,
    ObjectiveCPreprocessed,
    ObjectiveCPlusPlus,
    ObjectiveCPlusPlusPreprocessed,
    Assembler,
    AssemblerWithCpp,
}

impl Language {
    pub fn name(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::CPreprocessed => "cpp-output",
            Language::CPlusPlus => "c++",
            Language::CPlusPlusPreprocessed => "c++-cpp-output",
            Language::ObjectiveC => "objective-c",
            Language::ObjectiveCPreprocessed => "objective-c-cpp-output",
            Language::ObjectiveCPlusPlus => "objective-c++",
            Language::ObjectiveCPlusPlusPreprocessed => "objective-c++-cpp-output",
            Language::Assembler => "assembler",
            Language::AssemblerWithCpp => "assembler-with-cpp",
        }
    }

    fn from_name(name: &str) -> Option<Language> {
        [
            Language::CPlusPlus,
            Language::C,
            Language::CPreprocessed,
            Language::CPlusPlusPreprocessed,
            Language::ObjectiveC,
            Language::ObjectiveCPreprocessed,
            Language::ObjectiveCPlusPlus,
            Language::ObjectiveCPlusPlusPreprocessed,
            Language::AssemblerWithCpp,
            Language::Assembler,
        ]
        .into_iter()
        .find(|l| l.name() == name)
    }

    // https://gcc.gnu.org/onlinedocs/gcc/Overall-Options.html
    fn from_extension(ext: &str) -> Option<Language> {
        match ext {
            "C" | "cc" | "cxx" | "cpp" | "cp" | "CPP" | "c++" => Some(Language::CPlusPlus),
            "ii" => Some(Language::CPlusPlusPreprocessed),
            "c" => Some(Language::C),
            "i" => Some(Language::CPreprocessed),
            "m" => Some(Language::ObjectiveC),
            "mi" => Some(Language::ObjectiveCPreprocessed),
            "M" | "mm" => Some(Language::ObjectiveCPlusPlus),
            "mii" => Some(Language::ObjectiveCPlusPlusPreprocessed),
            "S" | "sx" => Some(Language::Assembler),
            "s" => Some(Language::AssemblerWithCpp),
            _ => None,
        }
    }

    pub fn is_preprocessed(self) -> bool {
        matches!(
            self,
            Language::CPreprocessed
                | Language::CPlusPlusPreprocessed
                | Language::ObjectiveCPreprocessed
                | Language::ObjectiveCPlusPlusPreprocessed
        )
    }

    fn is_assembler(self) -> bool {
        matches!(self, Language::Assembler | Language::AssemblerWithCpp)
    }
}

/// Why an invocation must (or need not) run locally. `Remote` is the one
/// value that allows offloading; everything else names the disqualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReason {
    Remote,
    Preprocess,
    DoNotAssemble,
    StdOutOutput,
    ParseError,
    NativeArch,
    Charset,
    ExtraFiles,
    MultiArch,
    MultiSource,
    StdinInput,
    NoSources,
    Link,
    NoIntegratedAs,
    BinPath,
}

impl LocalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalReason::Remote => "Remote",
            LocalReason::Preprocess => "Preprocess",
            LocalReason::DoNotAssemble => "DoNotAssemble",
            LocalReason::StdOutOutput => "StdOutOutput",
            LocalReason::ParseError => "ParseError",
            LocalReason::NativeArch => "NativeArch",
            LocalReason::Charset => "Charset",
            LocalReason::ExtraFiles => "ExtraFiles",
            LocalReason::MultiArch => "MultiArch",
            LocalReason::MultiSource => "MultiSource",
            LocalReason::StdinInput => "StdinInput",
            LocalReason::NoSources => "NoSources",
            LocalReason::Link => "Link",
            LocalReason::NoIntegratedAs => "NoIntegratedAs",
            LocalReason::BinPath => "BinPath",
        }
    }
}

/// Options that take following arguments, with their arity and whether the
/// tuple is semantically relevant to the output (and therefore hashed).
/// Sorted bytewise for binary search.
static OPTION_ARGS: &[(&str, usize, bool)] = &[
    ("--CLASSPATH", 1, true),
    ("--assert", 1, true),
    ("--bootclasspath", 1, true),
    ("--classpath", 1, true),
    ("--config", 1, true),
    ("--define-macro", 1, true),
    ("--dyld-prefix", 1, true),
    ("--encoding", 1, true),
    ("--extdirs", 1, true),
    ("--for-linker", 1, true),
    ("--force-link", 1, true),
    ("--include-directory", 1, true),
    ("--include-directory-after", 1, true),
    ("--include-prefix", 1, true),
    ("--include-with-prefix", 1, true),
    ("--include-with-prefix-after", 1, true),
    ("--include-with-prefix-before", 1, true),
    ("--language", 1, true),
    ("--library-directory", 1, true),
    ("--mhwdiv", 1, true),
    ("--output", 1, true),
    ("--output-class-directory", 1, true),
    ("--param", 1, true),
    ("--prefix", 1, true),
    ("--print-file-name", 1, true),
    ("--print-prog-name", 1, true),
    ("--resource", 1, true),
    ("--rtlib", 1, true),
    ("--serialize-diagnostics", 1, true),
    ("--std", 1, true),
    ("--stdlib", 1, true),
    ("--sysroot", 1, true),
    ("--system-header-prefix", 1, true),
    ("--undefine-macro", 1, true),
    ("-I", 1, false),
    ("-Xanalyzer", 1, true),
    ("-Xassembler", 1, true),
    ("-Xclang", 1, true),
    ("-Xcuda-fatbinary", 1, true),
    ("-Xcuda-ptxas", 1, true),
    ("-Xlinker", 1, true),
    ("-Xopenmp-target", 1, true),
    ("-Xpreprocessor", 1, true),
    ("-allowable_client", 1, true),
    ("-arch", 1, true),
    ("-arch_only", 1, true),
    ("-arcmt-migrate-report-output", 1, true),
    ("-bundle_loader", 1, true),
    ("-cxx-isystem", 1, false),
    ("-dependency-dot", 1, true),
    ("-dependency-file", 1, true),
    ("-dylib_file", 1, true),
    ("-exported_symbols_list", 1, true),
    ("-filelist", 1, true),
    ("-fmodule-implementation-of", 1, true),
    ("-fmodule-name", 1, true),
    ("-fmodules-user-build-path", 1, true),
    ("-fnew-alignment", 1, true),
    ("-force_load", 1, true),
    ("-framework", 1, true),
    ("-frewrite-map-file", 1, true),
    ("-ftrapv-handler", 1, true),
    ("-gcc-toolchain", 1, true),
    ("-image_base", 1, true),
    ("-imultilib", 1, true),
    ("-include", 1, true),
    ("-include-pch", 1, true),
    ("-init", 1, true),
    ("-install_name", 1, true),
    ("-isysroot", 1, true),
    ("-isystem", 1, false),
    ("-lazy_framework", 1, true),
    ("-lazy_library", 1, true),
    ("-meabi", 1, true),
    ("-mllvm", 1, true),
    ("-module-dependency-dir", 1, true),
    ("-mthread-model", 1, true),
    ("-multiply_defined", 1, true),
    ("-multiply_defined_unused", 1, true),
    ("-o", 1, true),
    ("-read_only_relocs", 1, true),
    ("-rpath", 1, true),
    ("-sectalign", 3, true),
    ("-sectcreate", 3, true),
    ("-sectobjectsymbols", 2, true),
    ("-sectorder", 3, true),
    ("-seg_addr_table", 1, true),
    ("-seg_addr_table_filename", 1, true),
    ("-segaddr", 2, true),
    ("-segcreate", 3, true),
    ("-segprot", 3, true),
    ("-segs_read_only_addr", 1, true),
    ("-segs_read_write_addr", 1, true),
    ("-serialize-diagnostics", 1, true),
    ("-target", 1, true),
    ("-umbrella", 1, true),
    ("-unexported_symbols_list", 1, true),
    ("-weak_framework", 1, true),
    ("-weak_library", 1, true),
    ("-weak_reference_mismatches", 1, true),
    ("-x", 1, true),
    ("-z", 1, true),
];

fn option_arg(name: &str) -> Option<(usize, bool)> {
    OPTION_ARGS
        .binary_search_by(|probe| probe.0.cmp(name))
        .ok()
        .map(|idx| (OPTION_ARGS[idx].1, OPTION_ARGS[idx].2))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `-Wa,` scanning, inherited from icecc: an embedded `-a<listing>=` option
/// or a leading non-option token after a comma means the assembler needs
/// files we can't ship.
fn wa_needs_local(arg: &str) -> bool {
    let bytes = arg.as_bytes();
    let mut pos = 3usize;
    while pos < bytes.len() {
        let Some(offset) = find_subslice(&bytes[pos + 1..], b"-a") else {
            break;
        };
        pos = pos + 1 + offset + 2;
        while pos < bytes.len() && bytes[pos].is_ascii_lowercase() {
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == b'=' {
            return true;
        }
        if pos >= bytes.len() {
            break;
        }
    }
    for &b in &bytes[3..] {
        match b {
            b',' | b' ' => continue,
            b'-' => break,
            _ => return true,
        }
    }
    false
}

/// What the classifier feeds the fingerprint with, when object caching is
/// enabled. A disabled sink swallows updates so the scanning logic stays
/// identical either way.
struct HashSink<'a> {
    fingerprint: Option<&'a mut Fingerprint>,
}

impl HashSink<'_> {
    fn update(&mut self, data: &str) {
        if let Some(fp) = self.fingerprint.as_deref_mut() {
            fp.update(data);
        }
    }

    fn update_range(&mut self, args: &[String]) {
        for arg in args {
            self.update(arg);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompilerArgs {
    pub command_line: Vec<String>,
    pub source_file_index: usize,
    pub object_file_index: usize,
    pub language: Language,
    pub has_dash_x: bool,
    pub has_m32: bool,
    pub has_m64: bool,
    pub has_mf: bool,
    pub has_md: bool,
    pub has_mmd: bool,
    pub has_mt: bool,
    pub dep_file: Option<String>,
}

impl CompilerArgs {
    pub fn source_file(&self) -> &str {
        &self.command_line[self.source_file_index]
    }

    pub fn output(&self) -> &str {
        &self.command_line[self.object_file_index]
    }

    /// Classifies a compiler command line. Returns the parsed arguments for
    /// a remotable job, or the reason the job must run locally.
    pub fn parse(
        info: &CompilerInfo,
        major_version: Option<u32>,
        mut command_line: Vec<String>,
        color: bool,
        json_diagnostics: bool,
        source_root: Option<&str>,
        mut fingerprint: Option<&mut Fingerprint>,
    ) -> Result<CompilerArgs, LocalReason> {
        let json_diagnostics = json_diagnostics
            && info.kind == CompilerKind::Gcc
            && major_version.is_some_and(|v| v >= 10);

        if !color || json_diagnostics {
            let mut i = 0;
            while i < command_line.len() {
                let arg = &mut command_line[i];
                if !color {
                    if arg == "-fcolor-diagnostics" {
                        *arg = "-fno-color-diagnostics".to_string();
                    } else if arg == "-fdiagnostics-color=always"
                        || arg == "-fdiagnostics-color=auto"
                    {
                        *arg = "-fdiagnostics-color=never".to_string();
                    }
                }
                if json_diagnostics && arg == "-fdiagnostics-parseable-fixits" {
                    command_line.remove(i);
                } else {
                    i += 1;
                }
            }
        }

        let mut sink = HashSink {
            fingerprint: fingerprint.as_deref_mut(),
        };
        let mut source_file_index = None;
        let mut object_file_index = None;
        let mut language: Option<Language> = None;
        let mut has_dash_c = false;
        let mut has_dash_x = false;
        let mut has_dash_o = false;
        let mut has_m32 = false;
        let mut has_m64 = false;
        let mut has_mf = false;
        let mut has_md = false;
        let mut has_mmd = false;
        let mut has_mt = false;
        let mut has_arch: Option<String> = None;
        let mut has_profile_dir = false;
        let mut has_profiling = false;

        let mut i = 1;
        while i < command_line.len() {
            let arg = command_line[i].clone();

            match arg.as_str() {
                "-S" => {
                    debug!("-S, running local");
                    return Err(LocalReason::DoNotAssemble);
                }
                "-E" => {
                    debug!("-E, running local");
                    return Err(LocalReason::Preprocess);
                }
                "-fno-integrated-as" => {
                    debug!("-fno-integrated-as, running local");
                    return Err(LocalReason::NoIntegratedAs);
                }
                "-M" | "-MM" => {
                    debug!("{}, running local", arg);
                    return Err(LocalReason::Preprocess);
                }
                "-march=native" | "-mcpu=native" | "-mtune=native" => {
                    debug!("local architecture optimization {}, running local", arg);
                    return Err(LocalReason::NativeArch);
                }
                "-" => {
                    debug!("stdin input, running local");
                    return Err(LocalReason::StdinInput);
                }
                "-c" => {
                    has_dash_c = true;
                    sink.update(&arg);
                    i += 1;
                    continue;
                }
                "-o" => {
                    if i + 1 >= command_line.len() {
                        return Err(LocalReason::ParseError);
                    }
                    if command_line[i + 1] == "-" {
                        debug!("-o -, running local");
                        return Err(LocalReason::StdOutOutput);
                    }
                    has_dash_o = true;
                    object_file_index = Some(i + 1);
                    sink.update_range(&command_line[i..i + 2]);
                    i += 2;
                    continue;
                }
                "-ftest-coverage" | "-fprofile-arcs" => {
                    has_profiling = true;
                    sink.update(&arg);
                    i += 1;
                    continue;
                }
                "-m32" => {
                    has_m32 = true;
                    sink.update(&arg);
                    i += 1;
                    continue;
                }
                "-m64" => {
                    has_m64 = true;
                    sink.update(&arg);
                    i += 1;
                    continue;
                }
                "-MF" | "-MT" => {
                    if i + 1 >= command_line.len() {
                        return Err(LocalReason::ParseError);
                    }
                    if arg == "-MF" {
                        has_mf = true;
                    } else {
                        has_mt = true;
                    }
                    sink.update_range(&command_line[i..i + 2]);
                    i += 2;
                    continue;
                }
                "-MD" => {
                    has_md = true;
                    sink.update(&arg);
                    i += 1;
                    continue;
                }
                "-MMD" => {
                    has_mmd = true;
                    sink.update(&arg);
                    i += 1;
                    continue;
                }
                "-Xclang" => {
                    if command_line.get(i + 1).map(String::as_str) == Some("-load") {
                        debug!("-Xclang -load, running local");
                        return Err(LocalReason::ExtraFiles);
                    }
                    if i + 1 >= command_line.len() {
                        return Err(LocalReason::ParseError);
                    }
                    sink.update_range(&command_line[i..i + 2]);
                    i += 2;
                    continue;
                }
                "-arch" => {
                    if i + 1 >= command_line.len() {
                        return Err(LocalReason::ParseError);
                    }
                    let arch = command_line[i + 1].clone();
                    if has_arch.as_deref().is_some_and(|prev| prev != arch) {
                        debug!("multiple -arch values, running local");
                        return Err(LocalReason::MultiArch);
                    }
                    has_arch = Some(arch);
                    sink.update_range(&command_line[i..i + 2]);
                    i += 2;
                    continue;
                }
                "-x" => {
                    has_dash_x = true;
                    if i + 1 >= command_line.len() {
                        return Err(LocalReason::ParseError);
                    }
                    if let Some(lang) = Language::from_name(&command_line[i + 1]) {
                        // -x takes precedence over the file extension
                        language = Some(lang);
                    }
                    sink.update_range(&command_line[i..i + 2]);
                    i += 2;
                    continue;
                }
                "-include" | "-include-pch" => {
                    if i + 1 >= command_line.len() {
                        return Err(LocalReason::ParseError);
                    }
                    sink.update_range(&command_line[i..i + 2]);
                    i += 2;
                    continue;
                }
                _ => {}
            }

            if arg.starts_with("-B") {
                debug!("{}, running local", arg);
                return Err(LocalReason::BinPath);
            }
            if arg.starts_with("-fexec-charset")
                || arg.starts_with("-fwide-exec-charset")
                || arg.starts_with("-finput-charset")
            {
                debug!("charset conversion {}, running local", arg);
                return Err(LocalReason::Charset);
            }
            if arg.starts_with("-fplugin=") || arg.starts_with("-fsanitize-blacklist=") {
                debug!("extra files {}, running local", arg);
                return Err(LocalReason::ExtraFiles);
            }
            if arg.starts_with("-fprofile-dir=") {
                has_profile_dir = true;
                sink.update(&arg);
                i += 1;
                continue;
            }
            if arg.starts_with("-Wa,") {
                if wa_needs_local(&arg) {
                    debug!("incompatible assembler arg {}, running local", arg);
                    return Err(LocalReason::ParseError);
                }
                i += 1;
                continue;
            }

            if let Some((count, hash)) = option_arg(&arg) {
                if i + count >= command_line.len() {
                    return Err(LocalReason::ParseError);
                }
                if hash {
                    sink.update_range(&command_line[i..i + count + 1]);
                }
                i += count + 1;
                continue;
            }

            if arg.starts_with("-I") {
                i += 1;
                continue;
            }

            if !arg.starts_with('-') {
                if let Some(first) = source_file_index {
                    if !has_dash_c {
                        has_dash_c = command_line[i..].iter().any(|a| a == "-c");
                    }
                    if !has_dash_c {
                        debug!("link job, running local");
                        return Err(LocalReason::Link);
                    }
                    debug!(
                        "multiple source files {} and {}",
                        command_line[first], arg
                    );
                    return Err(LocalReason::MultiSource);
                }
                source_file_index = Some(i);
                if language.is_none() {
                    language = Path::new(&arg)
                        .extension()
                        .and_then(|e| e.to_str())
                        .and_then(Language::from_extension);
                }
                let stripped = match source_root {
                    Some(root) if arg.starts_with(root) => &arg[root.len()..],
                    _ => arg.as_str(),
                };
                sink.update(stripped);
                i += 1;
                continue;
            }

            sink.update(&arg);
            i += 1;
        }

        let Some(source_file_index) = source_file_index else {
            debug!("no source file, running local");
            return Err(LocalReason::NoSources);
        };
        if !has_dash_c {
            debug!("link job, running local");
            return Err(LocalReason::Link);
        }
        let Some(language) = language else {
            debug!("unknown source language, running local");
            return Err(LocalReason::ParseError);
        };
        if language.is_assembler() {
            debug!("assembler input, running local");
            return Err(LocalReason::DoNotAssemble);
        }

        let object_file_index = match object_file_index {
            Some(index) if has_dash_o => index,
            _ => {
                let out = default_output(&command_line[source_file_index]);
                sink.update("-o");
                sink.update(&out);
                command_line.push("-o".to_string());
                command_line.push(out);
                command_line.len() - 1
            }
        };

        if has_profiling && !has_profile_dir {
            let output = &command_line[object_file_index];
            let dir = Path::new(output).parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.unwrap_or(Path::new("."));
            let dir = std::fs::canonicalize(dir)
                .ok()
                .or_else(|| dir.absolutize().ok().map(|p| p.into_owned()))
                .unwrap_or_else(|| dir.to_path_buf());
            let arg = format!("-fprofile-dir={}", dir.display());
            sink.update(&arg);
            command_line.push(arg);
        }

        if (has_md || has_mmd) && !has_mf {
            let output = command_line[object_file_index].clone();
            let stem = match output.rfind('.') {
                Some(dot) => &output[..dot],
                None => output.as_str(),
            };
            let dep = format!("{stem}.d");
            sink.update("-MF");
            sink.update(&dep);
            command_line.push("-MF".to_string());
            command_line.push(dep);
            has_mf = true;
        }

        if json_diagnostics {
            let arg = "-fdiagnostics-format=json".to_string();
            sink.update(&arg);
            command_line.push(arg);
        }

        if info.kind == CompilerKind::Clang && major_version.is_some_and(|v| v >= 15) {
            let arg = "-Wno-gnu-line-marker".to_string();
            sink.update(&arg);
            command_line.push(arg);
        }

        let dep_file = if has_mf {
            let mut dep = None;
            let mut iter = command_line.iter();
            while let Some(arg) = iter.next() {
                if arg == "-MF" {
                    dep = iter.next().cloned();
                }
            }
            dep
        } else {
            None
        };

        Ok(CompilerArgs {
            command_line,
            source_file_index,
            object_file_index,
            language,
            has_dash_x,
            has_m32,
            has_m64,
            has_mf,
            has_md,
            has_mmd,
            has_mt,
            dep_file,
        })
    }
}

fn default_output(source: &str) -> String {
    let base = Path::new(source)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(source);
    match base.rfind('.') {
        Some(dot) => format!("{}.o", &base[..dot]),
        None => format!("{base}.o"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn gcc_info() -> CompilerInfo {
        CompilerInfo {
            compiler: PathBuf::from("/usr/bin/gcc"),
            resolved: PathBuf::from("/usr/bin/gcc"),
            builder_compiler: "/usr/bin/gcc".to_string(),
            kind: CompilerKind::Gcc,
        }
    }

    fn clang_info() -> CompilerInfo {
        CompilerInfo {
            compiler: PathBuf::from("/usr/bin/clang"),
            resolved: PathBuf::from("/usr/bin/clang"),
            builder_compiler: "/usr/bin/clang".to_string(),
            kind: CompilerKind::Clang,
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn parse(info: &CompilerInfo, args: &[&str]) -> Result<CompilerArgs, LocalReason> {
        CompilerArgs::parse(info, Some(12), argv(args), true, false, None, None)
    }

    #[test]
    fn simple_remote_compile() {
        let parsed = parse(&gcc_info(), &["gcc", "-c", "foo.cpp", "-o", "foo.o", "-I", "inc"])
            .unwrap();
        assert_eq!(parsed.source_file(), "foo.cpp");
        assert_eq!(parsed.output(), "foo.o");
        assert_eq!(parsed.language, Language::CPlusPlus);
    }

    #[test]
    fn link_job_is_rejected() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "foo.o", "bar.o", "-o", "app"]).unwrap_err(),
            LocalReason::Link
        );
    }

    #[test]
    fn dash_c_anywhere_in_tail_counts() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "a.c", "b.c", "-o", "x", "-c"]).unwrap_err(),
            LocalReason::MultiSource
        );
    }

    #[test]
    fn preprocess_and_assembly_are_rejected() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-E", "a.c"]).unwrap_err(),
            LocalReason::Preprocess
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-S", "-c", "a.c"]).unwrap_err(),
            LocalReason::DoNotAssemble
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "a.s"]).unwrap_err(),
            LocalReason::DoNotAssemble
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-M", "a.c"]).unwrap_err(),
            LocalReason::Preprocess
        );
    }

    #[test]
    fn stdout_output_and_stdin_input_are_rejected() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "a.c", "-o", "-"]).unwrap_err(),
            LocalReason::StdOutOutput
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-", "-o", "a.o"]).unwrap_err(),
            LocalReason::StdinInput
        );
        // /dev/stdout is not special
        assert!(parse(&gcc_info(), &["gcc", "-c", "a.c", "-o", "/dev/stdout"]).is_ok());
    }

    #[test]
    fn native_arch_charset_and_plugins_are_rejected() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-march=native", "a.c"]).unwrap_err(),
            LocalReason::NativeArch
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-finput-charset", "a.c"]).unwrap_err(),
            LocalReason::Charset
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-fplugin=foo.so", "a.c"]).unwrap_err(),
            LocalReason::ExtraFiles
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-B/opt/bin", "a.c"]).unwrap_err(),
            LocalReason::BinPath
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-fno-integrated-as", "a.c"]).unwrap_err(),
            LocalReason::NoIntegratedAs
        );
    }

    #[test]
    fn multi_arch_rejected_only_on_conflict() {
        assert!(parse(
            &clang_info(),
            &["clang", "-c", "-arch", "x86_64", "-arch", "x86_64", "a.c"]
        )
        .is_ok());
        assert_eq!(
            parse(
                &clang_info(),
                &["clang", "-c", "-arch", "x86_64", "-arch", "arm64", "a.c"]
            )
            .unwrap_err(),
            LocalReason::MultiArch
        );
    }

    #[test]
    fn wa_parse() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-Wa,-alh=listing.lst", "a.c"]).unwrap_err(),
            LocalReason::ParseError
        );
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-Wa,src/code16gcc.s", "a.c"]).unwrap_err(),
            LocalReason::ParseError
        );
        assert!(parse(&gcc_info(), &["gcc", "-c", "-Wa,--noexecstack", "a.c"]).is_ok());
    }

    #[test]
    fn dash_x_overrides_extension() {
        let parsed = parse(&gcc_info(), &["gcc", "-c", "-x", "c++", "a.c", "-o", "a.o"]).unwrap();
        assert_eq!(parsed.language, Language::CPlusPlus);
        assert!(parsed.has_dash_x);
    }

    #[test]
    fn output_is_synthesized_from_source_basename() {
        let parsed = parse(&gcc_info(), &["gcc", "-c", "src/foo.cpp"]).unwrap();
        assert_eq!(parsed.output(), "foo.o");
        let tail = &parsed.command_line[parsed.command_line.len() - 2..];
        assert_eq!(tail, ["-o", "foo.o"]);
    }

    #[test]
    fn dep_file_is_synthesized_for_md() {
        let parsed = parse(&gcc_info(), &["gcc", "-c", "-MD", "a.c", "-o", "out/a.o"]).unwrap();
        assert_eq!(parsed.dep_file.as_deref(), Some("out/a.d"));
        assert!(parsed.command_line.iter().any(|a| a == "-MF"));

        let explicit =
            parse(&gcc_info(), &["gcc", "-c", "-MD", "-MF", "dep.d", "a.c", "-o", "a.o"]).unwrap();
        assert_eq!(explicit.dep_file.as_deref(), Some("dep.d"));
    }

    #[test]
    fn clang_15_gets_line_marker_suppression() {
        let parsed = CompilerArgs::parse(
            &clang_info(),
            Some(15),
            argv(&["clang", "-c", "a.c", "-o", "a.o"]),
            true,
            false,
            None,
            None,
        )
        .unwrap();
        assert!(parsed.command_line.iter().any(|a| a == "-Wno-gnu-line-marker"));
    }

    #[test]
    fn gcc_10_json_diagnostics_rewrite() {
        let parsed = CompilerArgs::parse(
            &gcc_info(),
            Some(10),
            argv(&[
                "gcc",
                "-c",
                "-fdiagnostics-parseable-fixits",
                "a.c",
                "-o",
                "a.o",
            ]),
            true,
            true,
            None,
            None,
        )
        .unwrap();
        assert!(!parsed
            .command_line
            .iter()
            .any(|a| a == "-fdiagnostics-parseable-fixits"));
        assert!(parsed
            .command_line
            .iter()
            .any(|a| a == "-fdiagnostics-format=json"));
    }

    #[test]
    fn color_flags_are_rewritten_without_tty() {
        let parsed = CompilerArgs::parse(
            &clang_info(),
            Some(12),
            argv(&[
                "clang",
                "-c",
                "-fcolor-diagnostics",
                "-fdiagnostics-color=always",
                "a.c",
                "-o",
                "a.o",
            ]),
            false,
            false,
            None,
            None,
        )
        .unwrap();
        assert!(parsed.command_line.iter().any(|a| a == "-fno-color-diagnostics"));
        assert!(parsed
            .command_line
            .iter()
            .any(|a| a == "-fdiagnostics-color=never"));
    }

    #[test]
    fn no_sources_is_rejected() {
        assert_eq!(
            parse(&gcc_info(), &["gcc", "-c", "-O2"]).unwrap_err(),
            LocalReason::NoSources
        );
    }

    #[test]
    fn fingerprint_ignores_skip_listed_options() {
        let mut with = Fingerprint::new();
        CompilerArgs::parse(
            &gcc_info(),
            Some(12),
            argv(&["gcc", "-c", "a.c", "-o", "a.o", "-I", "inc1"]),
            true,
            false,
            None,
            Some(&mut with),
        )
        .unwrap();
        let mut without = Fingerprint::new();
        CompilerArgs::parse(
            &gcc_info(),
            Some(12),
            argv(&["gcc", "-c", "a.c", "-o", "a.o", "-I", "inc2"]),
            true,
            false,
            None,
            Some(&mut without),
        )
        .unwrap();
        // -I values are not hashed; the preprocessed bytes carry their effect
        assert_eq!(with.finish_hex(), without.finish_hex());

        let mut d1 = Fingerprint::new();
        CompilerArgs::parse(
            &gcc_info(),
            Some(12),
            argv(&["gcc", "-c", "a.c", "-o", "a.o", "-DX=1"]),
            true,
            false,
            None,
            Some(&mut d1),
        )
        .unwrap();
        let mut d2 = Fingerprint::new();
        CompilerArgs::parse(
            &gcc_info(),
            Some(12),
            argv(&["gcc", "-c", "a.c", "-o", "a.o", "-DX=2"]),
            true,
            false,
            None,
            Some(&mut d2),
        )
        .unwrap();
        assert_ne!(d1.finish_hex(), d2.finish_hex());
    }

    #[test]
    fn source_root_is_stripped_from_fingerprint() {
        let mut a = Fingerprint::new();
        CompilerArgs::parse(
            &gcc_info(),
            Some(12),
            argv(&["gcc", "-c", "/home/alice/src/a.c", "-o", "a.o"]),
            true,
            false,
            Some("/home/alice/"),
            Some(&mut a),
        )
        .unwrap();
        let mut b = Fingerprint::new();
        CompilerArgs::parse(
            &gcc_info(),
            Some(12),
            argv(&["gcc", "-c", "/home/bob/src/a.c", "-o", "a.o"]),
            true,
            false,
            Some("/home/bob/"),
            Some(&mut b),
        )
        .unwrap();
        assert_eq!(a.finish_hex(), b.finish_hex());
    }

    #[test]
    fn sectcreate_consumes_three_arguments() {
        let parsed = parse(
            &clang_info(),
            &[
                "clang",
                "-c",
                "-sectcreate",
                "__TEXT",
                "__info",
                "info.plist",
                "a.c",
                "-o",
                "a.o",
            ],
        )
        .unwrap();
        assert_eq!(parsed.source_file(), "a.c");
    }

    #[test]
    fn option_table_is_sorted() {
        for pair in OPTION_ARGS.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} >= {}", pair[0].0, pair[1].0);
        }
    }
}
