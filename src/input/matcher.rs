use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Monitor,
    Skip,
}

/// Include/exclude rules applied to container names.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl NameFilter {
    pub fn new<S: AsRef<str>>(includes: &[S], excludes: &[S]) -> Result<Self, regex::Error> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| Regex::new(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// Decide whether a container carrying `names` should be tailed.
    ///
    /// Excludes always win. When include patterns are configured a container
    /// must match one of them, otherwise everything not excluded is tailed.
    pub fn decide<S: AsRef<str>>(&self, names: &[S]) -> Decision {
        let matches_any = |patterns: &[Regex]| {
            names
                .iter()
                .any(|name| patterns.iter().any(|re| re.is_match(name.as_ref())))
        };

        if matches_any(self.excludes.as_slice()) {
            return Decision::Skip;
        }
        if matches_any(self.includes.as_slice()) {
            return Decision::Monitor;
        }
        if self.includes.is_empty() {
            Decision::Monitor
        } else {
            Decision::Skip
        }
    }
}
