//! Disassembly output types

use serde::{Deserialize, Serialize};

/// One decoded instruction as rendered for the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub address: usize,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub length: usize,
    pub is_jump: bool,
    pub is_call: bool,
    pub is_ret: bool,
    /// Resolved destination for relative jumps and calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<usize>,
}

impl Instruction {
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_text() {
        let nop = Instruction {
            address: 0x1000,
            bytes: vec![0x90],
            mnemonic: "nop".to_string(),
            operands: String::new(),
            length: 1,
            is_jump: false,
            is_call: false,
            is_ret: false,
            target: None,
        };
        assert_eq!(nop.text(), "nop");

        let push = Instruction {
            operands: "rbp".to_string(),
            mnemonic: "push".to_string(),
            bytes: vec![0x55],
            ..nop
        };
        assert_eq!(push.text(), "push rbp");
    }

    #[test]
    fn test_instruction_target_omitted_when_none() {
        let insn = Instruction {
            address: 0x1000,
            bytes: vec![0xC3],
            mnemonic: "ret".to_string(),
            operands: String::new(),
            length: 1,
            is_jump: false,
            is_call: false,
            is_ret: true,
            target: None,
        };
        let json = serde_json::to_string(&insn).unwrap();
        assert!(!json.contains("target"));
    }
}
