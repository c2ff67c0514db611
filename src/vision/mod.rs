pub mod matcher;
pub mod templates;

pub use matcher::VisionMatcher;
pub use templates::TemplateSet;

use crate::device::Frame;
use serde::Serialize;

/// Every on-screen control the executor interacts with.
///
/// Each kind names its reference template and the control that should be
/// visible after a successful tap on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControlKind {
    HomeTab,
    SearchTab,
    SearchField,
    FollowButton,
    FollowingButton,
    UnfollowConfirm,
    FollowsYouBadge,
}

impl ControlKind {
    pub const ALL: [ControlKind; 7] = [
        ControlKind::HomeTab,
        ControlKind::SearchTab,
        ControlKind::SearchField,
        ControlKind::FollowButton,
        ControlKind::FollowingButton,
        ControlKind::UnfollowConfirm,
        ControlKind::FollowsYouBadge,
    ];

    pub fn template_id(&self) -> &'static str {
        match self {
            ControlKind::HomeTab => "home-icon",
            ControlKind::SearchTab => "search-icon",
            ControlKind::SearchField => "search-field",
            ControlKind::FollowButton => "follow-control",
            ControlKind::FollowingButton => "following-control",
            ControlKind::UnfollowConfirm => "unfollow-confirm",
            ControlKind::FollowsYouBadge => "follows-you",
        }
    }

    /// Post-tap signature. `None` for controls whose tap does not change
    /// what we verify against (navigation tabs, passive badges).
    pub fn expected_after_tap(&self) -> Option<ControlKind> {
        match self {
            ControlKind::SearchTab => Some(ControlKind::SearchField),
            ControlKind::FollowButton => Some(ControlKind::FollowingButton),
            ControlKind::FollowingButton => Some(ControlKind::UnfollowConfirm),
            ControlKind::UnfollowConfirm => Some(ControlKind::FollowButton),
            ControlKind::HomeTab | ControlKind::SearchField | ControlKind::FollowsYouBadge => None,
        }
    }
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.template_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Match {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub scale: f32,
}

impl Match {
    pub fn center(&self) -> (i32, i32) {
        self.bbox.center()
    }
}

/// Finds a control in a frame. `None` means "not on screen", which is an
/// expected outcome rather than an error. Implementations must be
/// deterministic for identical inputs.
pub trait ControlLocator: Send + Sync {
    fn locate(&self, frame: &Frame, kind: ControlKind, min_confidence: f32) -> Option<Match>;
}
