use chembalance::Equation;
use wasm_bindgen::prelude::*;


// Export a `equation_io` function from Rust to JavaScript.
#[wasm_bindgen]
/// Balance input equation and return output
/// First char is 1 if balancing succeeded (followed by the balanced equation), 0 otherwise (followed by the error)
pub fn equation_io(equation: &str) -> String {
    let mut equation = match Equation::parse(equation) {
        Ok(equation) => equation,
        Err(err) => return format!("0{}", err),
    };

    match equation.solve() {
        Ok(_) => match equation.solution_str() {
            Some(solution) => format!("1{}", solution),
            None => String::from("0No solution"),
        },
        Err(err) => format!("0{}", err),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success() {
        let output = equation_io("Fe + O2 -> Fe2O3");
        assert!(output.starts_with('1'));
        assert_eq!(&output[1..], "4 Fe + 3 O2 -> 2 Fe2O3");
    }

    #[test]
    fn failure() {
        assert_eq!(equation_io("H2 + O2"), "0Equation must have exactly two non-empty sides");
        assert_eq!(equation_io("H2 = O2"), "0No solution");
    }
}
