use common::cli::JitOpts;

use crate::analyzer::AnalyzerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    pub max_block_size: usize,
    pub block_link: bool,
    pub analyzer: AnalyzerOptions,
    /// One instruction per block, no linking, no reordering
    pub single_step: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            max_block_size: 64,
            block_link: true,
            analyzer: AnalyzerOptions::default(),
            single_step: false,
        }
    }
}

impl JitConfig {
    pub fn single_step() -> Self {
        JitConfig { single_step: true, ..Default::default() }
    }

    pub fn block_size(&self) -> usize {
        if self.single_step {
            1
        } else {
            self.max_block_size.max(1)
        }
    }

    pub fn links_blocks(&self) -> bool {
        self.block_link && !self.single_step
    }

    pub fn analyzer_options(&self) -> AnalyzerOptions {
        if self.single_step {
            AnalyzerOptions::empty()
        } else {
            self.analyzer
        }
    }
}

impl From<&JitOpts> for JitConfig {
    fn from(opts: &JitOpts) -> Self {
        let mut analyzer = AnalyzerOptions::default();
        if opts.no_reorder {
            analyzer -= AnalyzerOptions::BRANCH_MERGE | AnalyzerOptions::CARRY_MERGE | AnalyzerOptions::BRANCH_FOLLOW;
        }
        JitConfig {
            max_block_size: opts.block_size,
            block_link: !opts.no_block_link,
            analyzer,
            single_step: opts.single_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_step_overrides() {
        let config = JitConfig::single_step();
        assert_eq!(config.block_size(), 1);
        assert!(!config.links_blocks());
        assert_eq!(config.analyzer_options(), AnalyzerOptions::empty());
    }

    #[test]
    fn from_cli_options() {
        let opts = JitOpts {
            block_size: 0,
            no_block_link: true,
            no_reorder: true,
            single_step: false,
            budget: 10,
            disasm: false,
        };
        let config = JitConfig::from(&opts);
        assert_eq!(config.block_size(), 1);
        assert!(!config.links_blocks());
        assert_eq!(config.analyzer_options(), AnalyzerOptions::CONDITIONAL_CONTINUE);
    }
}
