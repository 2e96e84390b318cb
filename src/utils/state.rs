//! 终端生命周期状态管理
//!
//! 提供终端生命周期状态转换逻辑。
//!
//! ## 功能
//! - 定义有效的状态转换规则
//! - 提供状态转换验证
//! - 记录状态变更日志
//!
//! 生命周期循环：Idle -> Starting -> Running -> Stopping -> Idle。
//! 每轮循环都需要全新的后台上下文，停止后不允许复用旧上下文。

/// 终端生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// 空闲（未启动或已停止）
    Idle,
    /// 启动中（后台上下文正在初始化传输）
    Starting,
    /// 运行中（传输已就绪，write 有效）
    Running,
    /// 停止中（正在关闭传输和后台上下文）
    Stopping,
}

/// 状态转换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionResult {
    /// 转换成功
    Success,
    /// 转换无效（当前状态不允许转换到目标状态）
    Invalid {
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl StateTransitionResult {
    /// 检查转换是否成功
    pub fn is_success(&self) -> bool {
        matches!(self, StateTransitionResult::Success)
    }

    /// 检查转换是否失败
    pub fn is_invalid(&self) -> bool {
        matches!(self, StateTransitionResult::Invalid { .. })
    }
}

/// 生命周期状态机
///
/// 管理单个终端的状态转换，确保状态转换的有效性。
#[derive(Debug, Clone)]
pub struct LifecycleStateMachine {
    /// 当前状态
    current: LifecycleState,
}

impl LifecycleStateMachine {
    /// 创建新的状态机（初始为 Idle）
    pub fn new() -> Self {
        Self {
            current: LifecycleState::Idle,
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> LifecycleState {
        self.current
    }

    /// 检查终端是否正在运行
    pub fn is_running(&self) -> bool {
        self.current == LifecycleState::Running
    }

    /// 检查终端是否处于空闲状态（允许新的 start）
    pub fn is_idle(&self) -> bool {
        self.current == LifecycleState::Idle
    }

    /// 检查是否可以转换到目标状态
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        Self::is_valid_transition(self.current, target)
    }

    /// 尝试转换到目标状态
    ///
    /// 如果转换有效，更新状态并返回 Success。
    /// 如果转换无效，保持当前状态并返回 Invalid。
    pub fn transition_to(&mut self, target: LifecycleState) -> StateTransitionResult {
        if Self::is_valid_transition(self.current, target) {
            let from = self.current;
            self.current = target;
            tracing::debug!("终端状态转换: {:?} -> {:?}", from, target);
            StateTransitionResult::Success
        } else {
            tracing::warn!("无效状态转换: {:?} -> {:?}", self.current, target);
            StateTransitionResult::Invalid {
                from: self.current,
                to: target,
            }
        }
    }

    /// 检查状态转换是否有效
    ///
    /// 状态转换规则：
    /// - Idle -> Starting
    /// - Starting -> Running, Stopping, Idle（启动失败直接回到 Idle）
    /// - Running -> Stopping
    /// - Stopping -> Idle
    pub fn is_valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
        // 相同状态不需要转换
        if from == to {
            return true;
        }

        match from {
            LifecycleState::Idle => matches!(to, LifecycleState::Starting),
            LifecycleState::Starting => matches!(
                to,
                LifecycleState::Running | LifecycleState::Stopping | LifecycleState::Idle
            ),
            LifecycleState::Running => matches!(to, LifecycleState::Stopping),
            LifecycleState::Stopping => matches!(to, LifecycleState::Idle),
        }
    }
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
