use chembalance::{BalanceError, BalanceOptions, Equation, DEFAULT_EPSILON, DEFAULT_MAX_DENOMINATOR};
use clap::Parser;
use colored::Colorize;
use std::process;

#[derive(Parser)]
#[command(name = "chembalance")]
#[command(about = "Balance chemical equations such as \"Fe + O2 = Fe2O3\"")]
#[command(version)]
struct Args {
    /// Equation to balance, sides separated by `=`, `->`, `<->` or `>`
    equation: String,

    /// Values with smaller magnitude are treated as zero
    #[arg(long, default_value_t = DEFAULT_EPSILON)]
    epsilon: f64,

    /// Largest denominator tried when converting the solution to integers
    #[arg(long, default_value_t = DEFAULT_MAX_DENOMINATOR)]
    max_denominator: u64,

    /// Reject symbols that are not elements of the periodic table
    #[arg(long)]
    strict: bool,

    /// Print only the coefficients (reactants first) instead of the balanced equation
    #[arg(long)]
    coefficients: bool,
}

fn main() {
    let args = Args::parse();

    match run(&args) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<String, BalanceError> {
    let options = BalanceOptions {
        epsilon: args.epsilon,
        max_denominator: args.max_denominator,
        validate_elements: args.strict,
    };

    let mut equation = Equation::parse(&args.equation)?;
    equation.solve_with(&options)?;

    let output = if args.coefficients {
        equation.coefficients().map(|coeffs| coeffs.iter().map(i64::to_string).collect::<Vec<String>>().join(" "))
    } else {
        equation.solution_str()
    };

    output.ok_or(BalanceError::NoSolution)
}
