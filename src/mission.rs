use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Backend capability selected for one user turn.
///
/// On the wire each mission travels under its Chinese label; on the command
/// line it uses the kebab-case English name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum Mission {
    #[serde(rename = "法律咨询")]
    Consultation,
    #[serde(rename = "法条检索")]
    StatuteSearch,
    #[serde(rename = "类案检索")]
    CaseSearch,
    #[serde(rename = "判决预测")]
    VerdictPrediction,
}

/// How a mission's answer reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    /// Fire-and-forget trigger; the answer arrives as chunks on the channel.
    Streaming,
    /// One request, one finished list of result strings in the response.
    SingleShot,
}

impl Mission {
    pub const ALL: [Mission; 4] = [
        Mission::Consultation,
        Mission::StatuteSearch,
        Mission::CaseSearch,
        Mission::VerdictPrediction,
    ];

    /// The label the backend uses for this mission, in request bodies and
    /// as the `role` of stored retrieval results.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Mission::Consultation => "法律咨询",
            Mission::StatuteSearch => "法条检索",
            Mission::CaseSearch => "类案检索",
            Mission::VerdictPrediction => "判决预测",
        }
    }

    pub fn from_wire(name: &str) -> Option<Mission> {
        Mission::ALL.into_iter().find(|m| m.wire_name() == name)
    }

    pub fn request_shape(&self) -> RequestShape {
        match self {
            Mission::Consultation | Mission::VerdictPrediction => RequestShape::Streaming,
            Mission::StatuteSearch | Mission::CaseSearch => RequestShape::SingleShot,
        }
    }

    /// Retrieval missions answer with a list of result strings.
    pub fn is_retrieval(&self) -> bool {
        self.request_shape() == RequestShape::SingleShot
    }
}

impl std::fmt::Display for Mission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mission::Consultation => write!(f, "consultation"),
            Mission::StatuteSearch => write!(f, "statute-search"),
            Mission::CaseSearch => write!(f, "case-search"),
            Mission::VerdictPrediction => write!(f, "verdict-prediction"),
        }
    }
}
