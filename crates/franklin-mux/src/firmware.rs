//! Firmware upload recipes
//!
//! The coordinator only owns the busy/cancel contract of an upload; the
//! flashing itself is an external command built from a template. Boards
//! come from configuration, and two ports of the BeagleBone bridge board get
//! extra entries of their own.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// MCU of the Melzi board on the BeagleBone bridge
const BRIDGE_MCU: &str = "atmega1284p";

/// A board firmware can be built for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSpec {
    /// Tag used in upload requests
    pub tag: String,
    /// Human-readable name
    pub name: String,
    /// Microcontroller, selects the firmware image
    pub mcu: String,
    /// Programmer protocol
    pub protocol: String,
    /// Upload baud rate
    pub speed: u32,
}

impl BoardSpec {
    fn description(&self) -> String {
        format!(
            "{} ({}, {}, {} baud)",
            self.name, self.mcu, self.protocol, self.speed
        )
    }
}

/// One entry of an `upload_options` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOption {
    /// Board tag to pass to `upload`
    pub board: String,
    /// Human-readable description
    pub description: String,
}

impl UploadOption {
    /// Wire form: `[board, description]`
    pub fn to_value(&self) -> Value {
        json!([self.board, self.description])
    }
}

/// What to flash and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashRecipe {
    /// Melzi behind the BeagleBone bridge board
    Bridge {
        /// Bridge revision: 0 for v1 (`ttyS0`), 4 for v2 (`ttyS4`)
        revision: u8,
    },
    /// Regular board programmed over its serial port
    Board(BoardSpec),
}

impl FlashRecipe {
    /// Microcontroller the firmware is built for
    pub fn mcu(&self) -> &str {
        match self {
            FlashRecipe::Bridge { .. } => BRIDGE_MCU,
            FlashRecipe::Board(spec) => &spec.mcu,
        }
    }
}

/// A requested upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Port to flash through
    pub port: String,
    /// Board tag as requested
    pub board: String,
    /// Resolved recipe
    pub recipe: FlashRecipe,
}

fn bridge_revision(port: &str) -> Option<u8> {
    match port {
        "/dev/ttyS0" | "/dev/ttyO0" => Some(0),
        "/dev/ttyS4" | "/dev/ttyO4" => Some(4),
        _ => None,
    }
}

fn bridge_tag(revision: u8) -> String {
    if revision == 0 {
        "bbbmelzi ".to_string()
    } else {
        "bb4melzi ".to_string()
    }
}

/// Boards that can be flashed through `port`, bridge entry first, the rest
/// sorted by MCU and description
pub fn upload_options(port: &str, boards: &[BoardSpec]) -> Vec<UploadOption> {
    let mut options = Vec::new();
    if let Some(revision) = bridge_revision(port) {
        let version = if revision == 0 { 1 } else { 2 };
        options.push(UploadOption {
            board: bridge_tag(revision),
            description: format!(
                "Melzi from BeagleBone ({}, bridgeboard v{})",
                BRIDGE_MCU, version
            ),
        });
    }

    let mut sorted: Vec<&BoardSpec> = boards.iter().collect();
    sorted.sort_by(|a, b| {
        a.mcu
            .cmp(&b.mcu)
            .then_with(|| a.description().cmp(&b.description()))
    });
    options.extend(sorted.into_iter().map(|spec| UploadOption {
        board: spec.tag.clone(),
        description: spec.description(),
    }));
    options
}

/// Find the recipe for `board` on `port`
pub fn resolve_board(port: &str, board: &str, boards: &[BoardSpec]) -> Option<FlashRecipe> {
    if let Some(revision) = bridge_revision(port) {
        if board == bridge_tag(revision) {
            return Some(FlashRecipe::Bridge { revision });
        }
    }
    boards
        .iter()
        .find(|spec| spec.tag == board)
        .cloned()
        .map(FlashRecipe::Board)
}

/// Reply text for a finished upload; `Err` carries the tool output
pub fn upload_reply(board: &str, result: &Result<(), String>) -> String {
    match result {
        Ok(()) => format!("firmware for {board} successfully uploaded"),
        Err(output) => format!("firmware upload for {board}: {output}"),
    }
}

/// Reply text for a cancelled upload
pub fn aborted_reply(board: &str) -> String {
    upload_reply(board, &Err("Aborted".to_string()))
}

/// Command templates used by the system flasher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashTemplates {
    /// Regular boards. Placeholders: `#PORT#`, `#MCU#`, `#BAUD#`,
    /// `#PROTOCOL#`, `#FIRMWARE#`
    pub command: String,
    /// Bridge boards. Placeholders: `#BRIDGE#`, `#FIRMWARE#`
    pub bridge_command: String,
    /// Directory holding `<mcu>.hex` images
    pub firmware_dir: PathBuf,
}

impl Default for FlashTemplates {
    fn default() -> Self {
        Self {
            command: "avrdude -q -q -p #MCU# -b #BAUD# -c #PROTOCOL# -P #PORT# -U flash:w:#FIRMWARE#:i"
                .to_string(),
            bridge_command: "sudo flash-bb-#BRIDGE# #FIRMWARE#".to_string(),
            firmware_dir: PathBuf::from("/usr/share/franklin/firmware"),
        }
    }
}

impl FlashTemplates {
    /// Expand the template for a request into program and arguments
    pub fn expand(&self, request: &FlashRequest) -> Vec<String> {
        let firmware = self
            .firmware_dir
            .join(format!("{}.hex", request.recipe.mcu()))
            .to_string_lossy()
            .into_owned();
        let template = match &request.recipe {
            FlashRecipe::Bridge { revision } => self
                .bridge_command
                .replace("#BRIDGE#", &revision.to_string()),
            FlashRecipe::Board(spec) => self
                .command
                .replace("#PORT#", &request.port)
                .replace("#MCU#", &spec.mcu)
                .replace("#BAUD#", &spec.speed.to_string())
                .replace("#PROTOCOL#", &spec.protocol),
        };
        template
            .replace("#FIRMWARE#", &firmware)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boards() -> Vec<BoardSpec> {
        vec![
            BoardSpec {
                tag: "mega2560".into(),
                name: "Arduino Mega 2560".into(),
                mcu: "atmega2560".into(),
                protocol: "wiring".into(),
                speed: 115200,
            },
            BoardSpec {
                tag: "melzi".into(),
                name: "Melzi".into(),
                mcu: "atmega1284p".into(),
                protocol: "arduino".into(),
                speed: 115200,
            },
        ]
    }

    #[test]
    fn test_bridge_entry_comes_first() {
        let options = upload_options("/dev/ttyO4", &boards());
        let tags: Vec<&str> = options.iter().map(|o| o.board.as_str()).collect();
        assert_eq!(tags, vec!["bb4melzi ", "melzi", "mega2560"]);
        assert_eq!(
            options[2].description,
            "Arduino Mega 2560 (atmega2560, wiring, 115200 baud)"
        );

        assert_eq!(upload_options("/dev/ttyUSB0", &boards()).len(), 2);
    }

    #[test]
    fn test_resolve_board() {
        assert_eq!(
            resolve_board("/dev/ttyS0", "bbbmelzi ", &boards()),
            Some(FlashRecipe::Bridge { revision: 0 })
        );
        // bridge tag only valid on its own port
        assert_eq!(resolve_board("/dev/ttyUSB0", "bbbmelzi ", &boards()), None);
        assert!(matches!(
            resolve_board("/dev/ttyUSB0", "melzi", &boards()),
            Some(FlashRecipe::Board(spec)) if spec.mcu == "atmega1284p"
        ));
        assert_eq!(resolve_board("/dev/ttyUSB0", "uno", &boards()), None);
    }

    #[test]
    fn test_expand_template() {
        let templates = FlashTemplates {
            firmware_dir: PathBuf::from("/fw"),
            ..FlashTemplates::default()
        };
        let request = FlashRequest {
            port: "/dev/ttyUSB0".into(),
            board: "mega2560".into(),
            recipe: FlashRecipe::Board(boards().remove(0)),
        };
        let argv = templates.expand(&request);
        assert_eq!(argv[0], "avrdude");
        assert!(argv.contains(&"/dev/ttyUSB0".to_string()));
        assert!(argv.contains(&"flash:w:/fw/atmega2560.hex:i".to_string()));
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(
            upload_reply("melzi", &Ok(())),
            "firmware for melzi successfully uploaded"
        );
        assert_eq!(aborted_reply("melzi"), "firmware upload for melzi: Aborted");
    }
}
