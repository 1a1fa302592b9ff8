use ethers::prelude::abigen;

abigen!(
    ILaunchpad,
    r#"[
        function name() external view returns (string)
        function token() external view returns (address)
    ]"#
);
