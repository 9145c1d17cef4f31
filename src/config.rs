use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};

/// Top-level runtime configuration, loaded from a TOML file.
///
/// Every field has a default so an empty (or absent) file yields a
/// working configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dirs: DirsSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirsSection {
    #[serde(default = "default_input_dir")]
    pub input: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output: PathBuf,
    #[serde(default = "default_failed_dir")]
    pub failed: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Max LLM requests per minute (token-bucket size).
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// Max LLM requests per calendar day (persisted counter).
    #[serde(default = "default_rpd")]
    pub rpd: u32,
    /// Max retries for a single LLM call on 429.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// LLM call budget per document run.
    #[serde(default = "default_max_calls_per_doc")]
    pub max_calls_per_doc: u32,
    /// Seconds to wait for a rate-limiter token before giving up.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_workers() -> usize {
    2
}
fn default_input_dir() -> PathBuf {
    PathBuf::from("input_docs")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_failed_dir() -> PathBuf {
    PathBuf::from("failed")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}
fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5:7b".to_string()
}
fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}
fn default_temperature() -> f64 {
    0.0
}
fn default_rpm() -> u32 {
    7
}
fn default_rpd() -> u32 {
    20
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_calls_per_doc() -> u32 {
    3
}
fn default_acquire_timeout_secs() -> u64 {
    120
}

impl Default for DirsSection {
    fn default() -> Self {
        Self {
            input: default_input_dir(),
            output: default_output_dir(),
            failed: default_failed_dir(),
            cache: default_cache_dir(),
        }
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            rpm: default_rpm(),
            rpd: default_rpd(),
            max_retries: default_max_retries(),
            max_calls_per_doc: default_max_calls_per_doc(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dirs: DirsSection::default(),
            llm: LlmSection::default(),
            limits: LimitsSection::default(),
            workers: default_workers(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the config file, or fall back to defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.dirs.cache.join("manifest.json")
    }

    pub fn daily_counter_file(&self) -> PathBuf {
        self.dirs.cache.join("daily_llm_counter.json")
    }

    pub fn cache_db_file(&self) -> PathBuf {
        self.dirs.cache.join("lookup_cache.db")
    }
}

// ---------------------------------------------------------------------------
// Fixed domain tables
// ---------------------------------------------------------------------------

/// Raw UOM token → canonical short code.
pub const UOM_ALIASES: &[(&str, &str)] = &[
    ("EACH", "EA"),
    ("UNIT", "EA"),
    ("PC", "EA"),
    ("PCS", "EA"),
    ("PIECE", "EA"),
    ("PIECES", "EA"),
    ("EA", "EA"),
    ("CS", "CS"),
    ("CASE", "CS"),
    ("CASES", "CS"),
    ("BX", "BX"),
    ("BOX", "BX"),
    ("BOXES", "BX"),
    ("PK", "PK"),
    ("PACK", "PK"),
    ("PACKS", "PK"),
    ("PKG", "PK"),
    ("PACKAGE", "PK"),
    ("RL", "RL"),
    ("ROLL", "RL"),
    ("ROLLS", "RL"),
    ("DZ", "DZ"),
    ("DOZEN", "DZ"),
    ("CT", "CT"),
    ("COUNT", "CT"),
    ("BG", "BG"),
    ("BAG", "BG"),
    ("BAGS", "BG"),
    ("TB", "TB"),
    ("TUBE", "TB"),
    ("BT", "BT"),
    ("BTL", "BT"),
    ("BOTTLE", "BT"),
    ("GL", "GL"),
    ("GAL", "GL"),
    ("GALLON", "GL"),
    ("LB", "LB"),
    ("LBS", "LB"),
    ("POUND", "LB"),
    ("OZ", "OZ"),
    ("OUNCE", "OZ"),
    ("SH", "SH"),
    ("SHEET", "SH"),
    ("SHEETS", "SH"),
];

/// Canonical codes that contain multiple base units.
pub const PACK_UOMS: &[&str] = &["CS", "BX", "PK", "RL", "DZ", "CT", "BG", "TB", "BT"];

/// Canonical codes that already denote one base unit.
pub const EACH_UOMS: &[&str] = &["EA"];

/// The base unit every price is normalised to.
pub const CANONICAL_BASE_UOM: &str = "EA";

/// Below this confidence score an item is escalated for human review.
pub const CONFIDENCE_THRESHOLD: f64 = 0.60;

/// Rows whose description contains one of these are not line items.
pub const NON_ITEM_KEYWORDS: &[&str] = &[
    "subtotal",
    "sub total",
    "sub-total",
    "total",
    "grand total",
    "tax",
    "sales tax",
    "gst",
    "vat",
    "hst",
    "freight",
    "shipping",
    "delivery",
    "handling",
    "discount",
    "rebate",
    "credit",
    "adjustment",
    "round",
    "rounding",
    "round-off",
    "round off",
    "payment",
    "deposit",
    "balance due",
    "amount due",
    "invoice total",
    "order total",
    "net total",
    "surcharge",
    "fuel surcharge",
    "environmental fee",
];

// ── quality-gate thresholds (heuristic values, preserved as-is) ────────────

/// Fraction of items that must look degenerate before the gate trips.
pub const GATE_NOISE_RATIO: f64 = 0.6;
/// Descriptions shorter than this count as degenerate.
pub const GATE_SHORT_DESC_LEN: usize = 10;
/// Supplier strings shorter than this are structurally invalid.
pub const GATE_MIN_SUPPLIER_LEN: usize = 3;
/// Substrings that mark a supplier string as a markup artifact.
pub const GATE_BAD_SUPPLIER_PATTERNS: &[&str] =
    &["<!--", "##", "|", "---", "**", "image", "Invoice"];

/// Known supplier names for normalisation.
pub const KNOWN_SUPPLIERS: &[&str] = &[
    "Sysco",
    "US Foods",
    "Performance Food Group",
    "Gordon Food Service",
    "McLane Company",
    "Ben E. Keith",
    "Shamrock Foods",
    "Reinhart Foodservice",
    "Gala Janitorial Supplies",
    "Interboro Packaging",
    "Imperial Dade",
    "Essendant",
    "S.P. Richards",
    "Fastenal",
    "Grainger",
    "HD Supply",
    "Wesco International",
    "MSC Industrial",
    "Uline",
    "Staples",
    "Office Depot",
    "Magid Glove and Safety Manufacturing Co. LLC",
    "Cintas Corp",
];

/// Upper-cased supplier alias → canonical name.
pub const SUPPLIER_ALIASES: &[(&str, &str)] = &[
    ("SYSCO", "Sysco"),
    ("US FOODS", "US Foods"),
    ("USFOODS", "US Foods"),
    ("PFG", "Performance Food Group"),
    ("GFS", "Gordon Food Service"),
    ("GORDON FOOD", "Gordon Food Service"),
    ("MCLANE", "McLane Company"),
    ("SHAMROCK", "Shamrock Foods"),
    ("REINHART", "Reinhart Foodservice"),
    ("GALA", "Gala Janitorial Supplies"),
    ("GALA JANITORIAL", "Gala Janitorial Supplies"),
    ("INTERBORO", "Interboro Packaging"),
    ("IMPERIAL DADE", "Imperial Dade"),
    ("FASTENAL", "Fastenal"),
    ("GRAINGER", "Grainger"),
    ("ULINE", "Uline"),
    ("STAPLES", "Staples"),
    ("OFFICE DEPOT", "Office Depot"),
    ("MSC", "MSC Industrial"),
    ("MAGID", "Magid Glove and Safety Manufacturing Co. LLC"),
];
