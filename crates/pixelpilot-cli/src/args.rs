//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

const RESOURCE_DIR_HELP: &str =
    "Directory template paths resolve against [env: PIXELPILOT_RESOURCE_DIR]";

/// Visual automation pipelines for graphical applications.
///
/// Load a pipeline of recognize-then-act nodes, validate it, and run it
/// against captured frames. Runs can be driven from the command line or
/// over a JSON-line protocol on stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "pixelpilot", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load a pipeline document and report its nodes or the first error
    #[command(after_help = "\
Examples:
  pixelpilot validate tasks/daily.json
  pixelpilot validate tasks/daily.json --resource-dir assets/1080p")]
    Validate(ValidateArgs),

    /// Run a pipeline against recorded screenshots (dry run)
    #[command(after_help = "\
Frames are served in the order given; once exhausted, the last frame repeats.
Input operations are logged instead of being sent anywhere.

Examples:
  pixelpilot run tasks/daily.json --entry start --frame shot1.png --frame shot2.png
  pixelpilot run tasks/daily.json -e start -f home.png --json
  RUST_LOG=debug pixelpilot run tasks/daily.json -e start -f home.png")]
    Run(RunArgs),

    /// Serve the JSON-line protocol on stdin/stdout
    #[command(after_help = "\
One request per line, one response per line:
  {\"id\":\"1\",\"command\":{\"action\":\"list_pipelines\"}}")]
    Serve,

    /// Show an end-to-end usage example
    Examples,
}

#[derive(Debug, clap::Args)]
pub struct ValidateArgs {
    /// Pipeline document (JSON)
    pub pipeline: PathBuf,

    #[arg(long, value_name = "DIR", help = RESOURCE_DIR_HELP)]
    pub resource_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Pipeline document (JSON)
    pub pipeline: PathBuf,

    /// Node to start from
    #[arg(short, long, value_name = "NODE")]
    pub entry: String,

    /// Screenshot to replay as a captured frame (repeatable)
    #[arg(short, long = "frame", value_name = "IMAGE", required = true, num_args = 1..)]
    pub frames: Vec<PathBuf>,

    #[arg(long, value_name = "DIR", help = RESOURCE_DIR_HELP)]
    pub resource_dir: Option<PathBuf>,

    /// Print the run outcome as JSON
    #[arg(long)]
    pub json: bool,
}

/// End-to-end example text for the `examples` command.
pub const EXAMPLES_TEXT: &str = r#"End-to-end example: open the toolbox and place a tool

# 1. Write a pipeline. Node names map to nodes; "next" lists successors
#    in priority order. Template paths resolve against the document's
#    directory unless "$resource_base" or --resource-dir says otherwise.
cat > pick.json <<'EOF'
{
  "start": {
    "recognition": "DirectHit",
    "action": "Click",
    "target": [600, 300],
    "next": ["pick_tool"]
  },
  "pick_tool": {
    "recognition": "TemplateMatch",
    "template": "tool.png",
    "threshold": 0.8,
    "roi": [0, 0, 400, 720],
    "action": "Click",
    "next": ["place"]
  },
  "place": {
    "recognition": "ColorMatch",
    "lower": [100, 80, 80],
    "upper": [130, 255, 255],
    "count": 200,
    "action": "Swipe",
    "end": [900, 500],
    "duration": 300
  }
}
EOF

# 2. Check it loads
pixelpilot validate pick.json

# 3. Dry run it against screenshots
pixelpilot run pick.json --entry start --frame home.png --frame toolbox.png

# 4. Or drive it over the JSON-line protocol
pixelpilot serve <<'EOF'
{"id":"1","command":{"action":"list_pipelines"}}
EOF
"#;

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_run_parses_repeated_frames() {
        let cli = Cli::parse_from([
            "pixelpilot",
            "run",
            "pick.json",
            "--entry",
            "start",
            "-f",
            "a.png",
            "--frame",
            "b.png",
            "--json",
        ]);

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.entry, "start");
                assert_eq!(args.frames.len(), 2);
                assert!(args.json);
                assert!(args.resource_dir.is_none());
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_run_requires_a_frame() {
        let result = Cli::try_parse_from(["pixelpilot", "run", "pick.json", "--entry", "start"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_accepts_resource_dir() {
        let cli = Cli::parse_from([
            "pixelpilot",
            "validate",
            "pick.json",
            "--resource-dir",
            "assets",
        ]);

        match cli.command {
            Commands::Validate(args) => {
                assert_eq!(args.resource_dir.as_deref(), Some(std::path::Path::new("assets")));
            }
            _ => panic!("Expected validate command"),
        }
    }
}
