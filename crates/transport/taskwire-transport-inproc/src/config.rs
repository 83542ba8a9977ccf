use serde::Deserialize;

/// `inproc` 后端没有可调项；任何键都会被拒绝。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InprocOptions {}
