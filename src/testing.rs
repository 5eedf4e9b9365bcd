//! 测试专用开关：固定 IV、跳过档位填充
//!
//! 仅在本 crate 自身测试或启用 `testing` feature 时编译，
//! 生产构建无法获得该令牌。

use crate::encrypt::{DangerousIv, IvOverride};
use crate::format::Iv;

#[derive(Debug, Clone, Default)]
pub struct TestOverrides {
    iv: Option<Iv>,
    skip_padding: bool,
}

impl TestOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixed_iv(mut self, iv: Iv) -> Self {
        self.iv = Some(iv);
        self
    }

    pub fn skip_padding(mut self) -> Self {
        self.skip_padding = true;
        self
    }

    pub fn into_token(self) -> DangerousIv {
        DangerousIv(IvOverride::Test {
            iv: self.iv,
            skip_padding: self.skip_padding,
        })
    }
}
