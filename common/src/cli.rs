use clap::{Args, ValueEnum, ArgAction};

#[derive(Debug, Args)]
#[clap(name = "mu-dynarec", version, disable_help_flag = true, disable_version_flag = true)]
#[clap(next_help_heading = "Global Options")]
pub struct GlobalOpts<Cores>
where
    Cores: ValueEnum + Clone + Send + Sync + 'static
{
    #[clap(long, short, global = true, help_heading = "Select emulation Core")]
    pub core: Option<Cores>,

    /// Run the core on its own thread, pausing it once the budget is spent
    #[arg(long)]
    pub threaded: bool,

    #[arg(long, short, action = ArgAction::Help)]
    help: (),

    #[arg(long, short('V'), action = ArgAction::Version)]
    version: (),
}

/// Knobs shared by every recompiling core
#[derive(Debug, Clone, Args)]
#[clap(next_help_heading = "Recompiler Options")]
pub struct JitOpts {
    /// Maximum number of guest instructions per compiled block
    #[arg(long, default_value_t = 64)]
    pub block_size: usize,

    /// Never patch block exits to jump straight into their successor
    #[arg(long)]
    pub no_block_link: bool,

    /// Disable instruction reordering and branch following in the analyzer
    #[arg(long)]
    pub no_reorder: bool,

    /// Compile one instruction per block (implies --no-block-link and --no-reorder)
    #[arg(long)]
    pub single_step: bool,

    /// Guest cycles to run before returning control
    #[arg(long, default_value_t = 1_000_000)]
    pub budget: i64,

    /// Print the bytecode of every block left in the cache on exit
    #[arg(long)]
    pub disasm: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    enum TestCores {
        Alpha,
    }

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        global: GlobalOpts<TestCores>,
        #[command(flatten)]
        jit: JitOpts,
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["mu"]);
        assert_eq!(cli.global.core, None);
        assert_eq!(cli.jit.block_size, 64);
        assert!(!cli.jit.single_step);
    }

    #[test]
    fn jit_flags() {
        let cli = Cli::parse_from(["mu", "--core", "alpha", "--block-size", "8", "--no-block-link"]);
        assert_eq!(cli.global.core, Some(TestCores::Alpha));
        assert_eq!(cli.jit.block_size, 8);
        assert!(cli.jit.no_block_link);
    }
}
