use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Nothing outside these
// roots is scanned, so vendored or reference trees next to the crate are ignored.
const SOURCE_ROOTS: [&str; 4] = ["risk", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// Which lint a collector enforces; selects the report wording.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn headline(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed identifiers",
            Rule::ForbiddenComment => "forbidden comment patterns",
            Rule::UppercaseComment => "comments with all uppercase alphabetic characters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Rule::UnderscorePrefix => "Underscore-prefixed names are not allowed in rune.\n   \
                 Either use the binding (dropping the underscore) or remove it."
                .to_string(),
            Rule::ForbiddenComment => format!(
                "Comments containing any of {} are rejected.\n   \
                 The '**' pattern is only allowed in doc comments.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Rule::UppercaseComment => {
                "Comments written entirely in uppercase are rejected. Prefer deleting them."
                    .to_string()
            }
            Rule::AllowDeadCode => "Dead code must be used or deleted, not silenced.".to_string(),
        }
    }
}

// Collects matching lines from one file into a single report.
struct Violations {
    rule: Rule,
    file_path: PathBuf,
    lines: Vec<String>,
    allow_doc_stars: bool,
}

impl Violations {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            lines: Vec::new(),
            allow_doc_stars: false,
        }
    }

    fn allowing_doc_stars(mut self) -> Self {
        self.allow_doc_stars = true;
        self
    }

    fn into_error(self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.lines.len(),
            self.rule.headline(),
            self.file_path.display()
        );
        for line in &self.lines {
            message.push_str(&format!("   {line}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.advice()));
        Some(message)
    }

    fn accepts(&self, line: &str) -> bool {
        match self.rule {
            Rule::UnderscorePrefix => !is_comment(line) && !underscore_only_in_strings(line),
            Rule::ForbiddenComment => {
                let doc_stars = self.allow_doc_stars && is_doc_comment(line) && line.contains("**");
                !doc_stars || FORBIDDEN_WORDS.iter().any(|w| line.contains(w))
            }
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
            Rule::AllowDeadCode => true,
        }
    }
}

impl Sink for Violations {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.accepts(line) {
            self.lines.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// Every quoted segment sits at an odd index after splitting on quotes.
fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(start) = line.find("/*") {
        let body = &line[start + 2..];
        Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
    } else {
        None
    }
}

fn rust_sources(include_build_script: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = SOURCE_ROOTS
        .iter()
        .filter(|root| Path::new(root).is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect();
    if include_build_script {
        files.push(PathBuf::from("build.rs"));
    }
    files
}

fn scan(
    rule: Rule,
    pattern: &str,
    include_build_script: bool,
    allow_doc_stars: bool,
) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();
    for path in rust_sources(include_build_script) {
        let mut collector = Violations::new(rule, &path);
        if allow_doc_stars {
            collector = collector.allowing_doc_stars();
        }
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(message) = collector.into_error() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    check_build_script_lints();

    let forbidden_words = format!("(//|/\\*).*(?:{})", FORBIDDEN_WORDS.join("|"));
    let checks = [
        (Rule::UnderscorePrefix, r"\b(_[a-zA-Z0-9_]+)\b".to_string(), true, false),
        (Rule::ForbiddenComment, forbidden_words, false, false),
        (Rule::ForbiddenComment, r"(//|/\*).*\*\*".to_string(), false, true),
        (Rule::UppercaseComment, r"(//|/\*).*".to_string(), false, false),
        (
            Rule::AllowDeadCode,
            r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            false,
            false,
        ),
    ];

    for (rule, pattern, include_build_script, allow_doc_stars) in checks {
        if let Err(e) = scan(rule, &pattern, include_build_script, allow_doc_stars) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

// Compiles the build script on its own with unused items denied, so it obeys
// the same policy as the library.
fn check_build_script_lints() {
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "--emit",
            "metadata",
            "-o",
        ])
        .arg(std::env::temp_dir().join("rune-build-lint.rmeta"))
        .arg("build.rs")
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let offence = [
                ("unused variable", "Unused variables"),
                ("is never used", "Unused functions"),
                ("unused import", "Unused imports"),
            ]
            .into_iter()
            .find(|(needle, _)| stderr.contains(needle));
            if let Some((_, label)) = offence {
                eprintln!("\n❌ ERROR: {label} detected in build.rs!");
                eprintln!("{stderr}");
                eprintln!("\n⚠️ {label} are not allowed in rune. Use them or remove them.");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!("cargo:warning=Could not lint build.rs for unused items");
        }
    }
}
