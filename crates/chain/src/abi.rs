use std::path::Path;

use alloy::json_abi::JsonAbi;
use alloy::sol;

use crate::source::ChainError;

// ─── Launchpad Factory ──────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    contract TokenFactory {
        struct TokenPresalePair {
            address tokenAddress;
            address presaleAddress;
            address creator;
            uint256 createdAt;
            string tokenName;
            string tokenSymbol;
            uint256 totalSupply;
        }

        event TokenPresalePairCreated(
            address indexed token,
            address indexed presale,
            address indexed creator,
            uint256 totalSupply
        );
        event TokenPresaleLinked(address indexed token, address indexed presale);
        event CoordinatorInitialized(address tokenFactory, address presaleFactory);
        event OwnershipTransferred(address indexed previousOwner, address indexed newOwner);

        function totalPairsCreated() external view returns (uint256);
        function getAllTokenPresalePairs(uint256 offset, uint256 limit)
            external view returns (TokenPresalePair[] memory pairs, uint256 total);
        function getTokenPresalePairsByCreator(address creator, uint256 offset, uint256 limit)
            external view returns (TokenPresalePair[] memory pairs, uint256 total);
        function getTokenPresalePairDetails(address tokenAddress)
            external view returns (TokenPresalePair memory pair);
    }
}

// ─── Launchpad Token ────────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    contract LaunchToken {
        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);
        event PresaleContractSet(address indexed presale);
        event ExcludeFeeSet(address indexed account, bool excluded);
        event OwnershipTransferred(address indexed previousOwner, address indexed newOwner);
    }
}

// ─── Presale ────────────────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    contract Presale {
        event TokensPurchased(address indexed buyer, uint256 amount, uint256 tokenAmount);
        event TokensClaimed(address indexed user, uint256 amount);
        event PresaleStateChanged(uint8 oldState, uint8 newState);
        event LiquidityAdded(uint256 tokenAmount, uint256 bnbAmount);
        event PresaleStarted(uint256 startTime);
        event PresaleEnded(uint256 endTime);
        event BNBAccumulated(uint256 amount);

        function presaleStatus() external view returns (uint8);
        function maxInsideNum() external view returns (uint256);
        function totalPresaleBNB() external view returns (uint256);
    }
}

pub const FACTORY_ABI_JSON: &str = include_str!("../abi/TokenFactory.json");
pub const TOKEN_ABI_JSON: &str = include_str!("../abi/Token.json");
pub const PRESALE_ABI_JSON: &str = include_str!("../abi/Presale.json");

/// Factory view functions used by the list service.
pub const FN_TOTAL_PAIRS: &str = "totalPairsCreated";
pub const FN_ALL_PAIRS: &str = "getAllTokenPresalePairs";
pub const FN_PAIRS_BY_CREATOR: &str = "getTokenPresalePairsByCreator";
pub const FN_PAIR_DETAILS: &str = "getTokenPresalePairDetails";

/// Presale views behind a pair's sale status and progress.
pub const FN_PRESALE_STATUS: &str = "presaleStatus";
pub const FN_PRESALE_CAP: &str = "maxInsideNum";
pub const FN_PRESALE_SOLD: &str = "totalPresaleBNB";

/// The three ABIs the pipeline watches with.
#[derive(Debug, Clone)]
pub struct ContractAbis {
    pub factory: JsonAbi,
    pub token: JsonAbi,
    pub presale: JsonAbi,
}

impl ContractAbis {
    /// Built-in ABIs shipped with the crate.
    pub fn builtin() -> Result<Self, ChainError> {
        Ok(Self {
            factory: parse_abi(FACTORY_ABI_JSON)?,
            token: parse_abi(TOKEN_ABI_JSON)?,
            presale: parse_abi(PRESALE_ABI_JSON)?,
        })
    }

    /// Built-in ABIs, each replaced by the file at its override path when one is given.
    pub fn load(
        factory: Option<&Path>,
        token: Option<&Path>,
        presale: Option<&Path>,
    ) -> Result<Self, ChainError> {
        Ok(Self {
            factory: load_or(factory, FACTORY_ABI_JSON)?,
            token: load_or(token, TOKEN_ABI_JSON)?,
            presale: load_or(presale, PRESALE_ABI_JSON)?,
        })
    }
}

/// Parse a JSON ABI document (a bare array or a `{ "abi": [...] }` artifact).
pub fn parse_abi(json: &str) -> Result<JsonAbi, ChainError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ChainError::Abi(e.to_string()))?;
    let items = match value {
        serde_json::Value::Object(mut artifact) => artifact
            .remove("abi")
            .ok_or_else(|| ChainError::Abi("artifact has no `abi` field".into()))?,
        other => other,
    };
    serde_json::from_value(items).map_err(|e| ChainError::Abi(e.to_string()))
}

fn load_or(path: Option<&Path>, builtin: &str) -> Result<JsonAbi, ChainError> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| ChainError::Abi(format!("{}: {e}", path.display())))?;
            tracing::info!(path = %path.display(), "Loaded ABI override");
            parse_abi(&json)
        }
        None => parse_abi(builtin),
    }
}

/// Names of every event the ABI declares, deduplicated, in declaration order.
pub fn event_names(abi: &JsonAbi) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for event in abi.events() {
        if !names.contains(&event.name) {
            names.push(event.name.clone());
        }
    }
    names
}

/// Whether the ABI declares an event with this name.
pub fn declares_event(abi: &JsonAbi, name: &str) -> bool {
    abi.event(name).is_some_and(|overloads| !overloads.is_empty())
}
