use codegraph_core::{Chunk, Chunker, ChunkingConfig, Symbol};

/// One chunk per symbol span, split every `max_chunk_lines` lines, plus
/// file-level chunks (`symbol_index == None`) for runs of non-blank lines
/// outside every symbol.
#[derive(Debug, Clone)]
pub struct SymbolChunker {
    max_chunk_lines: u32,
}

impl SymbolChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self::with_max_lines(config.max_chunk_lines)
    }

    pub fn with_max_lines(max_chunk_lines: u32) -> Self {
        Self {
            max_chunk_lines: max_chunk_lines.max(1),
        }
    }

    fn push_split(
        &self,
        chunks: &mut Vec<Chunk>,
        lines: &[&str],
        symbol_index: Option<usize>,
        start_line: u32,
        end_line: u32,
    ) {
        let mut from = start_line;
        while from <= end_line {
            let to = from
                .saturating_add(self.max_chunk_lines - 1)
                .min(end_line);
            chunks.push(Chunk {
                symbol_index,
                start_line: from,
                end_line: to,
                content: lines[(from - 1) as usize..to as usize].join("\n"),
            });
            from = to + 1;
        }
    }
}

impl Default for SymbolChunker {
    fn default() -> Self {
        Self::new(&ChunkingConfig::default())
    }
}

impl Chunker for SymbolChunker {
    fn chunk_file(&self, content: &str, symbols: &[Symbol]) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len() as u32;
        let mut covered = vec![false; lines.len()];
        let mut chunks = Vec::new();

        for (index, symbol) in symbols.iter().enumerate() {
            if symbol.start_line == 0 || symbol.start_line > total {
                continue;
            }
            let end = symbol.end_line.clamp(symbol.start_line, total);
            for line in symbol.start_line..=end {
                covered[(line - 1) as usize] = true;
            }
            self.push_split(&mut chunks, &lines, Some(index), symbol.start_line, end);
        }

        let mut run_start: Option<u32> = None;
        for (i, line) in lines.iter().enumerate() {
            let number = i as u32 + 1;
            let top_level = !covered[i] && !line.trim().is_empty();
            match (top_level, run_start) {
                (true, None) => run_start = Some(number),
                (false, Some(start)) => {
                    self.push_split(&mut chunks, &lines, None, start, number - 1);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            self.push_split(&mut chunks, &lines, None, start, total);
        }

        chunks
    }
}
