//! Letter grid traversal.
//!
//! A word is on the grid when it can be spelled by a simple path of cells where
//! each step moves to one of the 8 neighbours of the previous cell.

use std::collections::HashMap;

use thiserror::Error;

/// A `(row, col)` position on the grid.
pub type Cell = (usize, usize);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("letter grid is empty")]
    Empty,
    #[error("letter grid rows must all have the same length")]
    Ragged,
    #[error("cell ({row}, {col}) must hold exactly one letter")]
    InvalidCell { row: usize, col: usize },
}

/// Collapses word-final letterforms to their base letter.
fn base_form(c: char) -> char {
    match c {
        'ך' => 'כ',
        'ם' => 'מ',
        'ן' => 'נ',
        'ף' => 'פ',
        'ץ' => 'צ',
        'ς' => 'σ',
        other => other,
    }
}

/// Lowercases and collapses final letterforms so grid letters and typed words compare equal.
pub fn normalize_letter(c: char) -> char {
    base_form(c.to_lowercase().next().unwrap_or(c))
}

pub fn normalize_word(word: &str) -> String {
    word.trim().chars().map(normalize_letter).collect()
}

/// A validated grid with its letter -> positions index, built once per round.
#[derive(Debug, Clone)]
pub struct LetterGrid {
    rows: Vec<Vec<String>>,
    cells: Vec<Vec<char>>,
    index: HashMap<char, Vec<Cell>>,
}

impl LetterGrid {
    pub fn from_rows(rows: &[Vec<String>]) -> Result<Self, GridError> {
        if rows.is_empty() || rows[0].is_empty() {
            return Err(GridError::Empty);
        }
        let width = rows[0].len();

        let mut cells = Vec::with_capacity(rows.len());
        let mut index: HashMap<char, Vec<Cell>> = HashMap::new();

        for (r, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(GridError::Ragged);
            }
            let mut normalized = Vec::with_capacity(width);
            for (c, letter) in row.iter().enumerate() {
                let mut chars = letter.trim().chars();
                let (Some(ch), None) = (chars.next(), chars.next()) else {
                    return Err(GridError::InvalidCell { row: r, col: c });
                };
                let ch = normalize_letter(ch);
                index.entry(ch).or_default().push((r, c));
                normalized.push(ch);
            }
            cells.push(normalized);
        }

        Ok(Self {
            rows: rows.to_vec(),
            cells,
            index,
        })
    }

    /// The grid exactly as the host sent it.
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn height(&self) -> usize {
        self.cells.len()
    }

    pub fn width(&self) -> usize {
        self.cells.first().map(Vec::len).unwrap_or(0)
    }

    fn cell_count(&self) -> usize {
        self.height() * self.width()
    }

    pub fn positions_of(&self, letter: char) -> &[Cell] {
        self.index
            .get(&normalize_letter(letter))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_word(&self, word: &str) -> bool {
        self.path_for_word(word).is_some()
    }

    /// Returns the first path spelling `word`, searching from every indexed start cell.
    pub fn path_for_word(&self, word: &str) -> Option<Vec<Cell>> {
        let letters: Vec<char> = normalize_word(word).chars().collect();
        if letters.is_empty() || letters.len() > self.cell_count() {
            return None;
        }

        // Reject early when some letter occurs more often than the grid holds it.
        let mut needed: HashMap<char, usize> = HashMap::new();
        for &l in &letters {
            *needed.entry(l).or_insert(0) += 1;
        }
        for (l, count) in &needed {
            if self.index.get(l).map(Vec::len).unwrap_or(0) < *count {
                return None;
            }
        }

        let mut visited = vec![false; self.cell_count()];
        let mut path = Vec::with_capacity(letters.len());
        for &start in self.positions_of(letters[0]) {
            if self.search(start, &letters, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    /// Checks a client-traced path: one in-bounds cell per letter, no cell
    /// twice, each step to a neighbour.
    pub fn traces(&self, word: &str, path: &[Cell]) -> bool {
        let letters: Vec<char> = normalize_word(word).chars().collect();
        if letters.is_empty() || letters.len() != path.len() {
            return false;
        }
        let mut visited = vec![false; self.cell_count()];
        for (i, (&(r, c), &letter)) in path.iter().zip(&letters).enumerate() {
            if r >= self.height() || c >= self.width() || self.cells[r][c] != letter {
                return false;
            }
            let slot = r * self.width() + c;
            if visited[slot] {
                return false;
            }
            visited[slot] = true;
            if i > 0 {
                let (pr, pc) = path[i - 1];
                if pr.abs_diff(r) > 1 || pc.abs_diff(c) > 1 {
                    return false;
                }
            }
        }
        true
    }

    fn search(&self, cell: Cell, letters: &[char], visited: &mut [bool], path: &mut Vec<Cell>) -> bool {
        let (r, c) = cell;
        let slot = r * self.width() + c;
        if visited[slot] || self.cells[r][c] != letters[path.len()] {
            return false;
        }

        visited[slot] = true;
        path.push(cell);
        if path.len() == letters.len() {
            return true;
        }

        for next in self.neighbours(cell) {
            if self.search(next, letters, visited, path) {
                return true;
            }
        }

        visited[slot] = false;
        path.pop();
        false
    }

    fn neighbours(&self, (r, c): Cell) -> impl Iterator<Item = Cell> + '_ {
        let (h, w) = (self.height() as isize, self.width() as isize);
        (-1isize..=1)
            .flat_map(|dr| (-1isize..=1).map(move |dc| (dr, dc)))
            .filter(|&(dr, dc)| dr != 0 || dc != 0)
            .filter_map(move |(dr, dc)| {
                let (nr, nc) = (r as isize + dr, c as isize + dc);
                (nr >= 0 && nr < h && nc >= 0 && nc < w).then_some((nr as usize, nc as usize))
            })
    }
}

/// Checks whether `word` can be traced on `grid`. Invalid grids never contain a word.
pub fn is_word_on_grid(word: &str, grid: &[Vec<String>]) -> bool {
    !word.trim().is_empty() && LetterGrid::from_rows(grid).is_ok_and(|g| g.contains_word(word))
}

pub fn path_for_word(word: &str, grid: &[Vec<String>]) -> Option<Vec<Cell>> {
    if word.trim().is_empty() {
        return None;
    }
    LetterGrid::from_rows(grid).ok()?.path_for_word(word)
}
